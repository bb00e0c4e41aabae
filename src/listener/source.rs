//! Event sources: the two interchangeable ways the listener reads new messages.
//!
//! - `ChangeFeedReader` tails a live insert feed and reports resume positions.
//! - `PollingReader` queries for messages newer than a cursor.
//!
//! Both are driven through `EventSource::next`, which yields one `Step` per call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::{ChangeFeed, Message, MessageId, MessageStore, ResumePosition, Result};

/// Which strategy is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    ChangeFeed,
    Polling,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChangeFeed => write!(f, "change_feed"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

/// Read position owned by the listener worker. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct Position {
    /// Change-feed resume marker covering everything dispatched so far.
    pub resume: Option<ResumePosition>,
    /// Identifier of the last dispatched message, used as the query cursor.
    pub last_id: Option<MessageId>,
    /// Whether the cursor has been anchored to the store's head.
    pub cursor_established: bool,
}

impl Position {
    /// Anchor the cursor on first activation so history before the listener
    /// started is never replayed. A cursor carried over from earlier reads is kept.
    pub async fn establish(&mut self, store: &dyn MessageStore) -> Result<()> {
        if self.cursor_established {
            return Ok(());
        }
        if self.last_id.is_none() {
            self.last_id = store.latest_id().await?;
        }
        self.cursor_established = true;
        info!(cursor = ?self.last_id, "Read cursor established");
        Ok(())
    }
}

/// Messages read in one step, in ascending identifier order.
#[derive(Debug)]
pub struct Batch {
    pub messages: Vec<Message>,
    /// Resume position to record once the batch has been dispatched.
    pub resume: Option<ResumePosition>,
}

/// Outcome of one read.
#[derive(Debug)]
pub enum Step {
    /// New messages to dispatch.
    Batch(Batch),
    /// Nothing new to dispatch. A change feed still reports how far it has
    /// read so a reopen starts from there.
    Idle { resume: Option<ResumePosition> },
    /// A change feed became available while polling.
    Upgrade,
}

// ============================================================================
// Change feed
// ============================================================================

/// Range query that fills the gap between the cursor and a feed opened
/// without a resume position.
struct CatchUp {
    store: Arc<dyn MessageStore>,
    channels: Option<Vec<String>>,
    batch_limit: usize,
}

/// Tails inserts on a live change feed.
pub struct ChangeFeedReader {
    feed: Box<dyn ChangeFeed>,
    max_wait: Duration,
    /// Present until the gap query comes back empty.
    catch_up: Option<CatchUp>,
    /// Highest identifier delivered by the gap query; the feed skips up to it.
    caught_up_through: Option<MessageId>,
    closed: bool,
}

impl ChangeFeedReader {
    /// Open a feed, resuming from `position.resume` when present.
    ///
    /// Without a resume position the feed starts at the store's current
    /// head, so messages after `position.last_id` are read by range query
    /// first.
    pub async fn open(
        store: &Arc<dyn MessageStore>,
        position: &Position,
        channels: Option<&[String]>,
        max_wait: Duration,
        batch_limit: usize,
    ) -> Result<Self> {
        let resuming = position.resume.is_some();
        let feed = store
            .open_change_feed(position.resume.clone(), channels)
            .await?;

        let catch_up = (!resuming).then(|| CatchUp {
            store: Arc::clone(store),
            channels: channels.map(<[String]>::to_vec),
            batch_limit,
        });

        info!(resuming, filtered = channels.is_some(), "Change feed opened");

        Ok(Self {
            feed,
            max_wait,
            catch_up,
            caught_up_through: None,
            closed: false,
        })
    }

    /// Position to record right after opening. `None` while the gap query
    /// is still pending, since a reopen from here would skip the gap.
    pub fn opened_at(&self) -> Option<ResumePosition> {
        match self.catch_up {
            Some(_) => None,
            None => self.feed.resume_position(),
        }
    }

    async fn next(&mut self, position: &Position) -> Result<Step> {
        if let Some(catch_up) = &self.catch_up {
            let messages = catch_up
                .store
                .query_after(position.last_id, catch_up.channels.as_deref(), catch_up.batch_limit)
                .await?;

            if let Some(last) = messages.last() {
                debug!(count = messages.len(), "Caught up messages from before the feed opened");
                self.caught_up_through = Some(last.id);
                return Ok(Step::Batch(Batch {
                    messages,
                    resume: None,
                }));
            }

            self.catch_up = None;
            info!(through = ?self.caught_up_through, "Change feed caught up");
            return Ok(Step::Idle {
                resume: self.feed.resume_position(),
            });
        }

        match self.feed.next(self.max_wait).await? {
            Some(event) => {
                let resume = event.resume.or_else(|| self.feed.resume_position());
                if self
                    .caught_up_through
                    .is_some_and(|through| event.message.id <= through)
                {
                    return Ok(Step::Idle { resume });
                }
                Ok(Step::Batch(Batch {
                    messages: vec![event.message],
                    resume,
                }))
            }
            None => Ok(Step::Idle {
                resume: self.feed.resume_position(),
            }),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.feed.close().await {
            warn!(error = %e, kind = e.kind(), "Error closing change feed");
        }
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Periodically queries for messages newer than the cursor.
pub struct PollingReader {
    store: Arc<dyn MessageStore>,
    batch_limit: usize,
    interval: Duration,
    /// Set after a partial batch; the next cycle sleeps first.
    sleep_first: bool,
}

impl PollingReader {
    pub fn new(store: Arc<dyn MessageStore>, batch_limit: usize, interval: Duration) -> Self {
        Self {
            store,
            batch_limit,
            interval,
            sleep_first: false,
        }
    }

    async fn next(&mut self, position: &Position, channels: Option<&[String]>) -> Result<Step> {
        if self.sleep_first {
            tokio::time::sleep(self.interval).await;
            self.sleep_first = false;
        }

        // The feed opened next catches up from the cursor, so nothing is lost here.
        if self.store.supports_change_feed().await? {
            info!("Store now supports a change feed, leaving polling mode");
            return Ok(Step::Upgrade);
        }

        // Without subscribed channels there is nothing to ask the store for.
        if channels.is_some_and(<[String]>::is_empty) {
            self.sleep_first = true;
            return Ok(Step::Idle { resume: None });
        }

        let messages = self
            .store
            .query_after(position.last_id, channels, self.batch_limit)
            .await?;

        // A full batch means there may be more backlog; poll again immediately.
        self.sleep_first = messages.len() < self.batch_limit;

        if messages.is_empty() {
            return Ok(Step::Idle { resume: None });
        }

        debug!(count = messages.len(), "Polled messages");
        Ok(Step::Batch(Batch {
            messages,
            resume: None,
        }))
    }
}

// ============================================================================
// Source
// ============================================================================

/// The active read strategy.
pub enum EventSource {
    ChangeFeed(ChangeFeedReader),
    Polling(PollingReader),
}

impl EventSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::ChangeFeed(_) => SourceKind::ChangeFeed,
            Self::Polling(_) => SourceKind::Polling,
        }
    }

    /// Read the next step. The caller advances `position` after dispatching
    /// a returned batch.
    pub async fn next(
        &mut self,
        position: &Position,
        channels: Option<&[String]>,
    ) -> Result<Step> {
        match self {
            Self::ChangeFeed(reader) => reader.next(position).await,
            Self::Polling(reader) => reader.next(position, channels).await,
        }
    }

    /// Release resources. Errors are logged, never returned. Idempotent.
    pub async fn close(&mut self) {
        if let Self::ChangeFeed(reader) = self {
            reader.close().await;
        }
    }
}
