//! Message store gateway.
//!
//! This module contains:
//! - `MessageStore` trait: insert, ordered range query, change-feed open, schema provisioning
//! - `ChangeFeed` trait: bounded-wait reads over a live insert feed
//! - Message, identifier and resume-position types shared by every backend
//! - Implementations: MongoDB, Mock (in-memory)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::StoreConfig;

#[cfg(feature = "mongodb")]
pub mod mongodb;
pub mod mock;

#[cfg(feature = "mongodb")]
pub use self::mongodb::MongoMessageStore;
pub use mock::MockMessageStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Change feed error: {0}")]
    ChangeFeed(String),

    #[error("Malformed message document: {0}")]
    Decode(String),

    #[error("Change feed is closed")]
    FeedClosed,

    #[error("Resume position rejected: {0}")]
    ResumeInvalid(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "mongodb")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] ::mongodb::error::Error),
}

impl StoreError {
    /// Short classification used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Query(_) => "query",
            Self::ChangeFeed(_) => "change_feed",
            Self::Decode(_) => "decode",
            Self::FeedClosed => "feed_closed",
            Self::ResumeInvalid(_) => "resume_invalid",
            Self::Unavailable(_) => "unavailable",
            #[cfg(feature = "mongodb")]
            Self::Mongo(_) => "mongodb",
        }
    }

    /// Whether the error looks like a network blip or topology change.
    ///
    /// Both transient and unexpected errors are retried by the listener;
    /// this only selects the log level.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Unavailable(_) | Self::FeedClosed => true,
            Self::Query(_) | Self::ChangeFeed(_) | Self::Decode(_) | Self::ResumeInvalid(_) => {
                false
            }
            #[cfg(feature = "mongodb")]
            Self::Mongo(e) => matches!(
                *e.kind,
                ::mongodb::error::ErrorKind::Io(_)
                    | ::mongodb::error::ErrorKind::ConnectionPoolCleared { .. }
                    | ::mongodb::error::ErrorKind::ServerSelection { .. }
            ),
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Store-assigned message identifier.
///
/// Twelve bytes compared lexicographically, which matches MongoDB `ObjectId`
/// ordering. Identifiers are non-decreasing in insertion order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId([u8; 12]);

impl MessageId {
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 12] {
        self.0
    }

    /// Identifier for the `n`th insert of a sequence-numbered store.
    pub fn from_sequence(n: u64) -> Self {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&n.to_be_bytes());
        Self(bytes)
    }

    /// Inverse of `from_sequence`.
    pub fn sequence(&self) -> u64 {
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&self.0[4..]);
        u64::from_be_bytes(tail)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// A persisted broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Opaque change-feed resume marker.
///
/// Only ever held in the listener's memory; never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct ResumePosition(Vec<u8>);

impl ResumePosition {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ResumePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumePosition({} bytes)", self.0.len())
    }
}

/// One insert observed on a change feed.
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub message: Message,
    /// Position immediately after this event.
    pub resume: Option<ResumePosition>,
}

// ============================================================================
// Traits
// ============================================================================

/// Live feed of inserts into the message collection.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Wait at most `max_wait` for the next insert.
    ///
    /// `Ok(None)` means the wait elapsed with no data; that is the normal idle
    /// condition, not an error.
    async fn next(&mut self, max_wait: Duration) -> Result<Option<FeedEvent>>;

    /// Position after the last event returned by `next`, if any.
    fn resume_position(&self) -> Option<ResumePosition>;

    /// Release the underlying cursor. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Operations against the shared message collection.
///
/// Implementations:
/// - `MongoMessageStore`: MongoDB (change streams on replica sets / sharded clusters)
/// - `MockMessageStore`: In-memory store for testing
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a broadcast. Safe under concurrent invocation.
    async fn insert(&self, channel: &str, payload: &str) -> Result<MessageId>;

    /// Up to `limit` messages with identifier strictly greater than `cursor`,
    /// ascending by identifier. `None` cursor starts from the beginning.
    ///
    /// With `channels` set, only those channels are returned.
    async fn query_after(
        &self,
        cursor: Option<MessageId>,
        channels: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Identifier of the most recently inserted message.
    async fn latest_id(&self) -> Result<Option<MessageId>>;

    /// Whether the store's current topology supports a change feed.
    async fn supports_change_feed(&self) -> Result<bool>;

    /// Open a feed of inserts, optionally resuming after `resume`.
    async fn open_change_feed(
        &self,
        resume: Option<ResumePosition>,
        channels: Option<&[String]>,
    ) -> Result<Box<dyn ChangeFeed>>;

    /// Provision the TTL and lookup indexes. Idempotent.
    async fn ensure_schema(&self) -> Result<()>;
}

// ============================================================================
// Factory
// ============================================================================

/// Connect to the configured store.
///
/// Requires the `mongodb` feature for `mongodb://` / `mongodb+srv://` URIs.
/// `memory://` returns a fresh `MockMessageStore`.
pub async fn connect_store(
    config: &StoreConfig,
    message_ttl: Duration,
) -> std::result::Result<Arc<dyn MessageStore>, Box<dyn std::error::Error + Send + Sync>> {
    if config.uri.starts_with("memory://") {
        info!(store = "memory", "Message store initialized");
        return Ok(Arc::new(MockMessageStore::with_ttl(message_ttl)));
    }

    #[cfg(feature = "mongodb")]
    {
        let store = MongoMessageStore::connect(config, message_ttl).await?;
        info!(
            store = "mongodb",
            database = %config.database,
            collection = %config.collection,
            "Message store initialized"
        );
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "mongodb"))]
    {
        Err(format!(
            "Store URI '{}' requires the 'mongodb' feature. Rebuild with --features mongodb",
            config.uri
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_sequence_ordering() {
        let a = MessageId::from_sequence(1);
        let b = MessageId::from_sequence(2);
        let c = MessageId::from_sequence(256);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.sequence(), 256);
    }

    #[test]
    fn test_message_id_display_is_hex() {
        let id = MessageId::from_sequence(255);
        assert_eq!(id.to_string(), "0000000000000000000000ff");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(StoreError::FeedClosed.kind(), "feed_closed");
        assert_eq!(StoreError::Query("boom".into()).kind(), "query");
        assert!(StoreError::Connection("reset".into()).is_transient());
        assert!(!StoreError::Decode("bad".into()).is_transient());
    }

    #[tokio::test]
    async fn test_connect_memory_store() {
        let config = StoreConfig {
            uri: "memory://".to_string(),
            ..Default::default()
        };
        let store = connect_store(&config, Duration::from_secs(60)).await.unwrap();
        assert!(store.latest_id().await.unwrap().is_none());
    }
}
