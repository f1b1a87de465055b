use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::ldap_protocol::InterceptedOp;
use crate::middleware::{ChainConfig, ObfuscationOptions};
use crate::proxy::{parse_listen_url, parse_target_url};
use crate::tables::AttributeOverrides;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub target: TargetConfig,
    /// Optional HTTP listen address for traffic statistics (e.g. "127.0.0.1:9090"). Endpoints: GET /metrics (Prometheus), GET /stats (JSON), GET /health.
    #[serde(default)]
    pub metrics_listen: Option<String>,
    /// Report every middleware step as it runs.
    #[serde(default)]
    pub verbose: bool,
    /// Seed for the per-connection random generators. Unset means fresh entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Largest LDAP message accepted from either side, in bytes. Larger frames end the session.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub intercept: InterceptConfig,
    #[serde(default)]
    pub paging: PagingConfig,
    #[serde(default)]
    pub chains: ChainConfig,
    #[serde(default)]
    pub options: ObfuscationOptions,
    /// Entries merged over the built-in attribute tables.
    #[serde(default)]
    pub attributes: AttributeOverrides,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    pub url: String,
}

/// Directory server to relay to: ldap:// for plaintext, ldaps:// for TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub url: String,
}

/// Which request types are rewritten. Everything else passes through byte for byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    pub search: bool,
    pub modify: bool,
    pub add: bool,
    pub delete: bool,
    pub modify_dn: bool,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            search: true,
            modify: false,
            add: false,
            delete: false,
            modify_dn: false,
        }
    }
}

impl InterceptConfig {
    pub fn is_enabled(&self, op: InterceptedOp) -> bool {
        match op {
            InterceptedOp::Search => self.search,
            InterceptedOp::Modify => self.modify,
            InterceptedOp::Add => self.add,
            InterceptedOp::Delete => self.delete,
            InterceptedOp::ModifyDn => self.modify_dn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Replay the first page's rewritten search, with the server's cookie, on follow-up pages.
    pub track_cookies: bool,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self { track_cookies: true }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Parse YAML config")?;
        Ok(config)
    }

    /// Check URLs and option ranges. Chain step names are checked when chains are built.
    pub fn validate(&self) -> Result<()> {
        parse_listen_url(&self.listen.url)?;
        parse_target_url(&self.target.url)?;
        if let Some(addr) = &self.metrics_listen {
            addr.parse::<std::net::SocketAddr>()
                .with_context(|| format!("Invalid metrics listen address: {}", addr))?;
        }
        if self.max_message_size < 64 {
            anyhow::bail!("max_message_size must be at least 64 bytes, got {}", self.max_message_size);
        }
        self.options.validate()
    }
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                url: "ldap://127.0.0.1:3389".to_string(),
            },
            target: TargetConfig {
                url: "ldap://127.0.0.1:389".to_string(),
            },
            metrics_listen: None,
            verbose: false,
            seed: None,
            max_message_size: default_max_message_size(),
            intercept: InterceptConfig::default(),
            paging: PagingConfig::default(),
            chains: ChainConfig::default(),
            options: ObfuscationOptions::default(),
            attributes: AttributeOverrides::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::AttributeFormat;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.listen.url, "ldap://127.0.0.1:3389");
        assert!(config.intercept.search);
        assert!(!config.intercept.modify);
        assert!(config.paging.track_cookies);
        assert!(config.chains.filter.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
listen:
  url: "ldap://0.0.0.0:3389"
target:
  url: "ldaps://dc01.corp.local:636"
metrics_listen: "127.0.0.1:9090"
verbose: true
seed: 42
intercept:
  search: true
  modify: true
  modify_dn: true
paging:
  track_cookies: false
chains:
  filter: ["Case", "DoubleNegation"]
  attr_list: ["Duplicate"]
  basedn: ["Spacing"]
options:
  case_probability: 0.9
  garbage_max: 5
attributes:
  oids:
    myAttr: "1.2.3.4"
  formats:
    myAttr: integer
  anr: ["myAttr"]
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.target.url, "ldaps://dc01.corp.local:636");
        assert_eq!(config.metrics_listen.as_deref(), Some("127.0.0.1:9090"));
        assert!(config.verbose);
        assert_eq!(config.seed, Some(42));
        assert!(config.intercept.is_enabled(InterceptedOp::Modify));
        assert!(config.intercept.is_enabled(InterceptedOp::ModifyDn));
        assert!(!config.intercept.is_enabled(InterceptedOp::Add));
        assert!(!config.paging.track_cookies);
        assert_eq!(config.chains.filter, vec!["Case", "DoubleNegation"]);
        assert!(config.chains.attr_entries.is_empty());
        assert_eq!(config.options.case_probability, 0.9);
        assert_eq!(config.options.garbage_max, 5);
        assert_eq!(config.options.garbage_min, 1);
        assert_eq!(config.attributes.oids["myAttr"], "1.2.3.4");
        assert_eq!(config.attributes.formats["myAttr"], AttributeFormat::Integer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_str_minimal() {
        let yaml = r#"
listen:
  url: "ldap://:3389"
target:
  url: "ldap://localhost:389"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.intercept, InterceptConfig::default());
        assert_eq!(config.options, ObfuscationOptions::default());
        assert!(config.seed.is_none());
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
listen:
  url: "ldap://127.0.0.1:3389"
target:
  url: "ldap://localhost:389"
chains:
  attr_list: ["ReplaceWithWildcard"]
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.chains.attr_list, vec!["ReplaceWithWildcard"]);
    }

    #[test]
    fn test_config_invalid() {
        assert!(Config::from_str("invalid: yaml: content: [").is_err());
        assert!(Config::from_file("/nonexistent/path/config.yaml").is_err());
        assert!(Config::from_str("listen:\n  url: \"ldap://:1\"\n").is_err());
    }

    #[test]
    fn test_config_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.target.url = "http://dc01:389".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.options.case_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.metrics_listen = Some("not an address".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_message_size = 10;
        assert!(config.validate().is_err());
    }
}
