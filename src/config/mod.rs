//! Relay configuration.
//!
//! Aggregates store and listener settings into a single `RelayConfig`
//! that can be loaded from YAML files or environment variables.

mod listener;
mod store;

pub use listener::ListenerConfig;
pub use store::StoreConfig;

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "docrelay.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DOCRELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DOCRELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DOCRELAY_LOG";

/// Main relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Shared store connection and collection.
    pub store: StoreConfig,
    /// Seconds a broadcast stays in the store before TTL expiry.
    pub message_ttl_secs: u64,
    /// Listener tuning.
    pub listener: ListenerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            message_ttl_secs: 60,
            listener: ListenerConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `docrelay.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: RelayConfig = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the listener cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.message_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "message_ttl_secs must be greater than zero".to_string(),
            ));
        }
        self.store.validate()?;
        self.listener.validate()
    }

    /// Message time-to-live.
    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    /// Config with short timings for tests.
    pub fn for_test() -> Self {
        Self {
            store: StoreConfig {
                uri: "memory://".to_string(),
                ..Default::default()
            },
            message_ttl_secs: 60,
            listener: ListenerConfig {
                reconnect_base_delay_secs: 0.005,
                reconnect_max_delay_secs: 0.05,
                poll_interval_ms: 10,
                batch_limit: 100,
                read_max_wait_ms: 20,
                shutdown_grace_ms: 500,
                require_change_feed: false,
                filter_channels: false,
            },
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
