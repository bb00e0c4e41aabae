//! Listener timing configuration.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;
use crate::utils::retry::ReconnectPolicy;

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Delay after the first failure, in seconds.
    pub reconnect_base_delay_secs: f64,
    /// Upper bound on the reconnect delay, in seconds.
    pub reconnect_max_delay_secs: f64,
    /// Sleep between polling cycles that returned a partial batch.
    pub poll_interval_ms: u64,
    /// Maximum messages fetched per polling query.
    pub batch_limit: usize,
    /// Bounded wait for a single change-feed read.
    pub read_max_wait_ms: u64,
    /// Time the worker gets to exit on shutdown before it is aborted.
    pub shutdown_grace_ms: u64,
    /// Fail startup when the store cannot provide a change feed.
    pub require_change_feed: bool,
    /// Restrict store reads to channels with local subscribers.
    pub filter_channels: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_secs: 1.0,
            reconnect_max_delay_secs: 60.0,
            poll_interval_ms: 500,
            batch_limit: 100,
            read_max_wait_ms: 1000,
            shutdown_grace_ms: 5000,
            require_change_feed: false,
            filter_channels: false,
        }
    }
}

impl ListenerConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        let base = self.reconnect_base_delay_secs;
        let max = self.reconnect_max_delay_secs;
        if !base.is_finite() || !max.is_finite() || base < 0.0 || max < 0.0 {
            return Err(ConfigError::Invalid(
                "reconnect delays must be finite and non-negative".to_string(),
            ));
        }
        if base > max {
            return Err(ConfigError::Invalid(format!(
                "reconnect_base_delay_secs ({}) exceeds reconnect_max_delay_secs ({})",
                base, max
            )));
        }
        if self.batch_limit == 0 {
            return Err(ConfigError::Invalid("batch_limit must be greater than zero".to_string()));
        }
        if self.read_max_wait_ms == 0 {
            return Err(ConfigError::Invalid(
                "read_max_wait_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_secs_f64(self.reconnect_base_delay_secs),
            Duration::from_secs_f64(self.reconnect_max_delay_secs),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_max_wait(&self) -> Duration {
        Duration::from_millis(self.read_max_wait_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
