//! Configuration module for pickup-server.
//!
//! Handles loading configuration from the TOML file, CLI overrides and
//! environment variables, and converts it into the core runtime settings.

pub mod file;

use crate::config::file::{DlqConfig, FileConfig, RelayConfig};
use pickup_core::config::{DlqSettings, RelaySettings};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub use file::{BrokerConfig, LogFormat, LoggingConfig};

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub listen: SocketAddr,
    pub max_connections: u32,
    pub logging: LoggingConfig,
    pub broker: BrokerConfig,
    pub relay: RelaySettings,
    pub dlq: DlqSettings,
}

pub struct ConfigLoader {
    config_path: PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Read, validate and convert the configuration file.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let content = std::fs::read_to_string(&self.config_path)?;
        let file_config: FileConfig = toml::from_str(&content)?;
        self.build(file_config)
    }

    /// Re-read the file on SIGHUP. Only the relay and DLQ sections are
    /// applied by the caller; the rest needs a restart.
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }

    fn build(&self, file_config: FileConfig) -> Result<LoadedConfig, ConfigError> {
        validate(&file_config)?;
        Ok(LoadedConfig {
            listen: self.listen_override.unwrap_or(file_config.server.listen),
            max_connections: file_config.database.max_connections,
            logging: file_config.logging,
            broker: file_config.broker,
            relay: convert_relay(&file_config.relay, &file_config.dlq),
            dlq: convert_dlq(&file_config.dlq),
        })
    }
}

/// One day.
const MAX_BASE_DELAY_SECS: i64 = 86_400;

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    let positive = [
        ("relay.batch_size", config.relay.batch_size),
        ("dlq.batch_size", config.dlq.batch_size),
        ("dlq.max_retries", i64::from(config.dlq.max_retries)),
        ("dlq.base_delay_secs", config.dlq.base_delay_secs),
    ];
    for (name, value) in positive {
        if value <= 0 {
            return Err(ConfigError::ValidationError(format!(
                "{name} must be positive, got {value}"
            )));
        }
    }
    if config.dlq.base_delay_secs > MAX_BASE_DELAY_SECS {
        return Err(ConfigError::ValidationError(format!(
            "dlq.base_delay_secs must be at most {MAX_BASE_DELAY_SECS}, got {}",
            config.dlq.base_delay_secs
        )));
    }
    if config.relay.interval_ms == 0 || config.dlq.interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "poll intervals must be positive".to_string(),
        ));
    }
    if config.broker.topic.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "broker.topic must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// The DLQ fields a relay stamps on new messages come from `[dlq]`.
fn convert_relay(relay: &RelayConfig, dlq: &DlqConfig) -> RelaySettings {
    RelaySettings {
        batch_size: relay.batch_size,
        interval: Duration::from_millis(relay.interval_ms),
        dead_letter_on_failure: relay.dead_letter_on_failure,
        dlq_max_retries: dlq.max_retries,
        dlq_base_delay: time::Duration::seconds(dlq.base_delay_secs),
    }
}

fn convert_dlq(dlq: &DlqConfig) -> DlqSettings {
    DlqSettings {
        batch_size: dlq.batch_size,
        interval: Duration::from_millis(dlq.interval_ms),
        base_delay: time::Duration::seconds(dlq.base_delay_secs),
    }
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}
