pub mod ber;
pub mod config;
pub mod config_source;
pub mod cookies;
pub mod error;
pub mod filter;
pub mod ldap_protocol;
pub mod metrics;
pub mod middleware;
pub mod observer;
pub mod proxy;
pub mod tables;
pub mod tls;

pub use config::Config;
pub use config_source::{ConfigOverrides, ConfigSource, LiveConfig};
pub use error::{CodecError, ProxyError};
pub use metrics::{run_metrics_server, TrafficStats};
pub use observer::{ProxyObserver, TracingObserver};
pub use proxy::ObfuscatingProxy;
