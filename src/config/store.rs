//! Store connection configuration.

use serde::Deserialize;

use super::ConfigError;

/// Shared store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection URI (`mongodb://...`, `mongodb+srv://...`, or `memory://`).
    pub uri: String,
    /// Database name.
    pub database: String,
    /// Collection holding broadcast messages.
    pub collection: String,
    /// Insert acknowledgment: "majority", a node count, or a tag set name.
    pub write_concern: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "docrelay".to_string(),
            collection: "broadcasts".to_string(),
            write_concern: "majority".to_string(),
        }
    }
}

impl StoreConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.collection.is_empty() {
            return Err(ConfigError::Invalid("store.collection must not be empty".to_string()));
        }
        if self.database.is_empty() {
            return Err(ConfigError::Invalid("store.database must not be empty".to_string()));
        }
        Ok(())
    }
}
