//! TOML file configuration structures.
//!
//! These structs directly map to the `pickup-config.toml` file format.
//! Every section except `[broker]` may be omitted.

use serde::Deserialize;
use std::net::SocketAddr;
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address of the health endpoints (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directives. `RUST_LOG` takes precedence.
    #[serde(default)]
    pub filter: Option<String>,
}

/// Kafka REST proxy the relay and DLQ worker publish to.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub rest_proxy_url: Url,
    pub topic: String,
    #[serde(default = "default_broker_timeout")]
    pub timeout_secs: u64,
}

fn default_broker_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub batch_size: i64,
    pub interval_ms: u64,
    pub dead_letter_on_failure: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            interval_ms: 1000,
            dead_letter_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub batch_size: i64,
    pub interval_ms: u64,
    /// Resends allowed per message before it is parked.
    pub max_retries: i32,
    /// Backoff unit for both the relay's hand-off and the worker's resends.
    pub base_delay_secs: i64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            interval_ms: 5000,
            max_retries: 5,
            base_delay_secs: 30,
        }
    }
}
