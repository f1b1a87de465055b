//! Live configuration: the current config together with the chains and lookup
//! tables built from it, swapped atomically when the source changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::middleware::{ChainSet, MiddlewareRegistry};
use crate::tables::AttributeTables;

/// Everything derived from one config. Sessions load it once per intercepted packet.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub config: Config,
    pub chains: ChainSet,
    pub tables: AttributeTables,
}

impl ConfigSnapshot {
    /// Validate `config` and build its chains and tables.
    pub fn build(config: Config) -> Result<Self> {
        config.validate()?;
        let registry = MiddlewareRegistry::new(config.options.clone());
        let chains = registry.build_chains(&config.chains)?;
        let tables = AttributeTables::builtin().with_overrides(&config.attributes);
        Ok(Self {
            config,
            chains,
            tables,
        })
    }
}

/// Command-line values that win over whatever the source says, on every reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub listen: Option<String>,
    pub target: Option<String>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.listen {
            config.listen.url = url.clone();
        }
        if let Some(url) = &self.target {
            config.target.url = url.clone();
        }
    }
}

/// Shared handle to the current snapshot. Clones observe the same updates.
#[derive(Clone)]
pub struct LiveConfig {
    current: Arc<ArcSwap<ConfigSnapshot>>,
    overrides: ConfigOverrides,
}

impl LiveConfig {
    pub fn from_config(config: Config) -> Result<Self> {
        Self::with_overrides(config, ConfigOverrides::default())
    }

    pub fn with_overrides(mut config: Config, overrides: ConfigOverrides) -> Result<Self> {
        overrides.apply(&mut config);
        let snapshot = ConfigSnapshot::build(config)?;
        Ok(Self {
            current: Arc::new(ArcSwap::from_pointee(snapshot)),
            overrides,
        })
    }

    /// Current snapshot. Later updates do not affect the returned value.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Validate and swap in a new config. On error the current snapshot stays.
    /// A changed listen URL only takes effect on restart; the target applies to new sessions.
    pub fn update(&self, mut config: Config) -> Result<()> {
        self.overrides.apply(&mut config);
        let snapshot = ConfigSnapshot::build(config)?;
        if snapshot.config.listen != self.current.load().config.listen {
            info!("Listen URL changed; restart to rebind");
        }
        self.current.store(Arc::new(snapshot));
        Ok(())
    }

    /// Re-read `path` and apply it with `update`.
    pub fn reload(&self, path: &Path) -> Result<()> {
        let config = Config::from_file(path)?;
        self.update(config)
    }
}

/// Where the configuration comes from.
pub enum ConfigSource {
    /// YAML file, optionally watched for changes.
    File { path: PathBuf },
    /// Config assembled in memory (command-line only runs, tests).
    Inline(Config),
}

impl ConfigSource {
    pub fn load(&self, overrides: ConfigOverrides) -> Result<LiveConfig> {
        let config = match self {
            ConfigSource::File { path } => {
                let cfg = Config::from_file(path).context("Load config from file")?;
                info!("Configuration loaded from file: {:?}", path);
                cfg
            }
            ConfigSource::Inline(cfg) => cfg.clone(),
        };
        LiveConfig::with_overrides(config, overrides)
    }
}

/// Running file watch. Dropping it stops both the watcher and the reload task.
pub struct FileWatch {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for FileWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// True for create/modify events that name `file`.
fn touches(event: &Event, file: &Path) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event.paths.iter().any(|p| p.file_name() == file.file_name())
}

/// Watch `path` and apply it to `live` whenever it changes. Invalid files are
/// logged and skipped. The parent directory is watched so that editors which
/// replace the file by rename are still seen.
pub fn spawn_file_watch(path: PathBuf, live: LiveConfig) -> Result<FileWatch> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let _ = tx.send(event);
        }
        Err(e) => warn!("Config watcher error: {}", e),
    })
    .context("Create config file watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Watch {:?}", dir))?;

    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !touches(&event, &path) {
                continue;
            }
            // One save usually produces a burst of events.
            while rx.try_recv().is_ok() {}
            debug!("Config file {:?} changed, reloading", path);
            match live.reload(&path) {
                Ok(()) => info!("Configuration reloaded from {:?}", path),
                Err(e) => error!("Config reload from {:?} failed: {:#}", path, e),
            }
        }
    });
    Ok(FileWatch {
        _watcher: watcher,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const BASE: &str = r#"
listen:
  url: "ldap://127.0.0.1:3389"
target:
  url: "ldap://127.0.0.1:389"
chains:
  filter: ["DoubleNegation"]
"#;

    fn config_with_filter_chain(steps: &[&str]) -> Config {
        let mut cfg = Config::default();
        cfg.chains.filter = steps.iter().map(|s| s.to_string()).collect();
        cfg
    }

    #[test]
    fn test_snapshot_builds_chains_and_tables() {
        let mut cfg = config_with_filter_chain(&["Case", "reorder"]);
        cfg.attributes.oids.insert("myAttr".to_string(), "1.2.3.4".to_string());
        let live = LiveConfig::from_config(cfg).unwrap();
        let snap = live.snapshot();
        assert_eq!(snap.chains.filter.step_names(), vec!["Case", "Reorder"]);
        assert_eq!(snap.tables.oid("MYATTR"), Some("1.2.3.4"));
        assert_eq!(snap.tables.oid("cn"), Some("2.5.4.3"));
    }

    #[test]
    fn test_unknown_step_is_rejected() {
        let err = LiveConfig::from_config(config_with_filter_chain(&["NoSuchStep"]))
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown filter middleware 'NoSuchStep'"));
    }

    #[test]
    fn test_update_swaps_and_keeps_old_on_error() {
        let live = LiveConfig::from_config(config_with_filter_chain(&["Case"])).unwrap();
        let before = live.snapshot();

        live.update(config_with_filter_chain(&["DeMorgan"])).unwrap();
        assert_eq!(live.snapshot().chains.filter.step_names(), vec!["DeMorgan"]);
        assert_eq!(before.chains.filter.step_names(), vec!["Case"]);

        assert!(live.update(config_with_filter_chain(&["Bogus"])).is_err());
        assert_eq!(live.snapshot().chains.filter.step_names(), vec!["DeMorgan"]);
    }

    #[test]
    fn test_overrides_survive_updates() {
        let overrides = ConfigOverrides {
            listen: None,
            target: Some("ldaps://dc01:636".to_string()),
        };
        let live = LiveConfig::with_overrides(Config::default(), overrides).unwrap();
        assert_eq!(live.snapshot().config.target.url, "ldaps://dc01:636");
        live.update(Config::default()).unwrap();
        assert_eq!(live.snapshot().config.target.url, "ldaps://dc01:636");
    }

    #[test]
    fn test_source_load() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(BASE.as_bytes()).unwrap();
        file.flush().unwrap();
        let live = ConfigSource::File {
            path: file.path().to_path_buf(),
        }
        .load(ConfigOverrides::default())
        .unwrap();
        assert_eq!(live.snapshot().chains.filter.step_names(), vec!["DoubleNegation"]);

        let live = ConfigSource::Inline(Config::default())
            .load(ConfigOverrides::default())
            .unwrap();
        assert!(live.snapshot().chains.filter.is_empty());

        assert!(ConfigSource::File {
            path: PathBuf::from("/nonexistent/config.yaml")
        }
        .load(ConfigOverrides::default())
        .is_err());
    }

    #[test]
    fn test_reload_reads_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(BASE.as_bytes()).unwrap();
        file.flush().unwrap();
        let live = LiveConfig::from_config(Config::default()).unwrap();
        live.reload(file.path()).unwrap();
        assert_eq!(live.snapshot().chains.filter.step_names(), vec!["DoubleNegation"]);

        std::fs::write(file.path(), "chains: [").unwrap();
        assert!(live.reload(file.path()).is_err());
        assert_eq!(live.snapshot().chains.filter.step_names(), vec!["DoubleNegation"]);
    }

    #[test]
    fn test_touches_filters_by_name_and_kind() {
        use notify::event::{CreateKind, ModifyKind};
        let path = PathBuf::from("/etc/obf/config.yaml");
        let modify = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(path.clone());
        let other = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("/etc/obf/other.yaml"));
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(path.clone());
        assert!(touches(&modify, &path));
        assert!(touches(&create, &path));
        assert!(!touches(&other, &path));
        assert!(!touches(&access, &path));
    }

    #[tokio::test]
    async fn test_file_watch_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, BASE).unwrap();
        let live = ConfigSource::File { path: path.clone() }
            .load(ConfigOverrides::default())
            .unwrap();
        let watch = spawn_file_watch(path.clone(), live.clone()).unwrap();

        // Same length as before, so only the content differs.
        let updated = BASE.replace("[\"DoubleNegation\"]", "[\"Reorder\",\"Case\"]");
        assert_eq!(updated.len(), BASE.len());
        std::fs::write(&path, updated).unwrap();

        let mut reloaded = false;
        for _ in 0..250 {
            if live.snapshot().chains.filter.step_names() == vec!["Reorder", "Case"] {
                reloaded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        drop(watch);
        assert!(reloaded);
    }
}
