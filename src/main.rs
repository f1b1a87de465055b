use clap::Parser;
use ldap_obfuscator::config_source::{self, ConfigOverrides};
use ldap_obfuscator::{run_metrics_server, Config, ConfigSource, ObfuscatingProxy, TracingObserver, TrafficStats};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, error};
use anyhow::Result;

#[derive(Parser)]
#[command(name = "ldap-obfuscator")]
#[command(about = "LDAP obfuscating proxy - Rewrites intercepted LDAP requests into equivalent variants before relaying them to a directory server")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen URL (overrides config; e.g. ldap://:3389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Target directory URL (overrides config; e.g. ldaps://dc01.corp.local:636)
    #[arg(short = 't', long, value_name = "URL")]
    target: Option<String>,

    /// Reload the configuration file when it changes. Used with --config.
    #[arg(short, long)]
    watch: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_obfuscator={},info", log_level))
        .init();

    info!("Starting LDAP obfuscating proxy");

    let source = if let Some(path) = args.config.clone() {
        info!("Configuration source: file {:?}", path);
        ConfigSource::File { path }
    } else if args.target.is_some() {
        info!("Configuration source: command line");
        ConfigSource::Inline(Config::default())
    } else {
        error!("Set --config <FILE> or --target <URL>");
        std::process::exit(1);
    };

    let overrides = ConfigOverrides {
        listen: args.listen.clone(),
        target: args.target.clone(),
    };
    let live_config = source.load(overrides)?;

    {
        let snapshot = live_config.snapshot();
        let cfg = &snapshot.config;
        info!("Configuration loaded:");
        info!("  Listen URL: {}", cfg.listen.url);
        info!("  Target URL: {}", cfg.target.url);
        info!("  Filter chain: {:?}", snapshot.chains.filter.step_names());
        info!("  Attribute list chain: {:?}", snapshot.chains.attr_list.step_names());
        info!("  BaseDN chain: {:?}", snapshot.chains.basedn.step_names());
        info!("  Attribute entries chain: {:?}", snapshot.chains.attr_entries.step_names());
        if let Some(seed) = cfg.seed {
            info!("  Seed: {}", seed);
        }
    }

    let _watch = match (args.watch, args.config.clone()) {
        (true, Some(path)) => {
            info!("Watching {:?} for changes", path);
            Some(config_source::spawn_file_watch(path, live_config.clone())?)
        }
        (true, None) => {
            error!("--watch requires --config; ignoring");
            None
        }
        (false, _) => None,
    };

    let stats = Arc::new(TrafficStats::new());

    if let Some(addr) = live_config.snapshot().config.metrics_listen.clone() {
        let stats_for_http = Arc::clone(&stats);
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, stats_for_http).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let proxy = ObfuscatingProxy::new(live_config, stats, Arc::new(TracingObserver));

    proxy.start().await?;

    Ok(())
}
