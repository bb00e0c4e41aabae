//! In-memory message store for tests and local development.
//!
//! Simulates a change feed with a broadcast channel, applies TTL on every
//! access, and supports failure injection so listener recovery paths can be
//! exercised without a database.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{timeout_at, Instant};

use super::{
    ChangeFeed, FeedEvent, Message, MessageId, MessageStore, ResumePosition, Result, StoreError,
};

/// Buffered inserts per open change feed before it reports lag.
const FEED_CAPACITY: usize = 4096;

/// Consume one pending injected failure, if any.
fn take_failure(pending: &AtomicUsize) -> bool {
    pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn channel_matches(channels: Option<&[String]>, channel: &str) -> bool {
    channels.map_or(true, |set| set.iter().any(|c| c == channel))
}

fn encode_position(seq: u64) -> ResumePosition {
    ResumePosition::new(seq.to_be_bytes().to_vec())
}

fn decode_position(position: &ResumePosition) -> Result<u64> {
    let bytes: [u8; 8] = position
        .as_bytes()
        .try_into()
        .map_err(|_| StoreError::ResumeInvalid("resume position not recognised".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

struct Inner {
    messages: Vec<Message>,
    next_seq: u64,
}

/// Mock message store that keeps messages in memory.
pub struct MockMessageStore {
    inner: RwLock<Inner>,
    feed: broadcast::Sender<Message>,
    ttl: Duration,
    change_feed_supported: AtomicBool,
    fail_reads: Arc<AtomicUsize>,
    fail_inserts: AtomicBool,
    feeds_opened: AtomicUsize,
    schema_calls: AtomicUsize,
}

impl Default for MockMessageStore {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(60))
    }
}

impl MockMessageStore {
    /// Store with a change feed and a 60 second TTL.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                messages: Vec::new(),
                next_seq: 1,
            }),
            feed,
            ttl,
            change_feed_supported: AtomicBool::new(true),
            fail_reads: Arc::new(AtomicUsize::new(0)),
            fail_inserts: AtomicBool::new(false),
            feeds_opened: AtomicUsize::new(0),
            schema_calls: AtomicUsize::new(0),
        }
    }

    /// Store whose topology cannot provide a change feed.
    pub fn polling_only() -> Self {
        let store = Self::default();
        store.set_change_feed_supported(false);
        store
    }

    pub fn set_change_feed_supported(&self, supported: bool) {
        self.change_feed_supported.store(supported, Ordering::SeqCst);
    }

    /// Fail the next `count` read operations (queries, feed opens, feed reads).
    pub fn fail_next_reads(&self, count: usize) {
        self.fail_reads.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Number of change feeds opened so far.
    pub fn feeds_opened(&self) -> usize {
        self.feeds_opened.load(Ordering::SeqCst)
    }

    pub fn schema_calls(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }

    /// Messages currently stored (after TTL expiry).
    pub async fn len(&self) -> usize {
        let mut inner = self.inner.write().await;
        Self::purge_expired(&mut inner);
        inner.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn purge_expired(inner: &mut Inner) {
        let now = Utc::now();
        inner.messages.retain(|m| m.expires_at > now);
    }

    fn check_read(&self) -> Result<()> {
        if take_failure(&self.fail_reads) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MockMessageStore {
    async fn insert(&self, channel: &str, payload: &str) -> Result<MessageId> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected insert failure".to_string()));
        }

        let mut inner = self.inner.write().await;
        Self::purge_expired(&mut inner);

        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| StoreError::Query(format!("invalid ttl: {}", e)))?;
        let message = Message {
            id: MessageId::from_sequence(inner.next_seq),
            channel: channel.to_string(),
            payload: payload.to_string(),
            created_at,
            expires_at: created_at + ttl,
        };
        inner.next_seq += 1;
        inner.messages.push(message.clone());

        // Sent under the write lock so feeds opened concurrently see each
        // message either in their backlog or live, never both or neither.
        let _ = self.feed.send(message.clone());

        Ok(message.id)
    }

    async fn query_after(
        &self,
        cursor: Option<MessageId>,
        channels: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.check_read()?;

        let mut inner = self.inner.write().await;
        Self::purge_expired(&mut inner);

        Ok(inner
            .messages
            .iter()
            .filter(|m| cursor.map_or(true, |c| m.id > c))
            .filter(|m| channel_matches(channels, &m.channel))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_id(&self) -> Result<Option<MessageId>> {
        self.check_read()?;
        let inner = self.inner.read().await;
        Ok(inner.messages.last().map(|m| m.id))
    }

    async fn supports_change_feed(&self) -> Result<bool> {
        Ok(self.change_feed_supported.load(Ordering::SeqCst))
    }

    async fn open_change_feed(
        &self,
        resume: Option<ResumePosition>,
        channels: Option<&[String]>,
    ) -> Result<Box<dyn ChangeFeed>> {
        self.check_read()?;
        if !self.change_feed_supported.load(Ordering::SeqCst) {
            return Err(StoreError::ChangeFeed(
                "change feeds require a replica set".to_string(),
            ));
        }

        let inner = self.inner.read().await;
        let receiver = self.feed.subscribe();
        let head = inner.next_seq - 1;

        let backlog = match resume {
            Some(ref position) => {
                let after = decode_position(position)?;
                inner
                    .messages
                    .iter()
                    .filter(|m| m.id.sequence() > after)
                    .filter(|m| channel_matches(channels, &m.channel))
                    .cloned()
                    .collect()
            }
            None => VecDeque::new(),
        };
        let start = match resume {
            Some(ref position) => decode_position(position)?,
            None => head,
        };
        drop(inner);

        self.feeds_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockChangeFeed {
            receiver: Some(receiver),
            backlog,
            head,
            position: start,
            channels: channels.map(<[String]>::to_vec),
            failures: Arc::clone(&self.fail_reads),
        }))
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Change feed over the mock store's insert broadcast.
struct MockChangeFeed {
    receiver: Option<broadcast::Receiver<Message>>,
    /// Messages replayed from a resume position.
    backlog: VecDeque<Message>,
    /// Last sequence covered by the backlog; live events at or below it are skipped.
    head: u64,
    /// Sequence of the last returned event.
    position: u64,
    channels: Option<Vec<String>>,
    failures: Arc<AtomicUsize>,
}

impl MockChangeFeed {
    fn event(&mut self, message: Message) -> FeedEvent {
        self.position = message.id.sequence();
        FeedEvent {
            message,
            resume: Some(encode_position(self.position)),
        }
    }
}

#[async_trait]
impl ChangeFeed for MockChangeFeed {
    async fn next(&mut self, max_wait: Duration) -> Result<Option<FeedEvent>> {
        if self.receiver.is_none() {
            return Err(StoreError::FeedClosed);
        }
        if take_failure(&self.failures) {
            return Err(StoreError::Unavailable("injected change feed failure".to_string()));
        }

        if let Some(message) = self.backlog.pop_front() {
            return Ok(Some(self.event(message)));
        }

        let deadline = Instant::now() + max_wait;
        loop {
            let receiver = self.receiver.as_mut().ok_or(StoreError::FeedClosed)?;
            let message = match timeout_at(deadline, receiver.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(message)) => message,
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    return Err(StoreError::ChangeFeed(format!("feed lagged by {} events", n)));
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(StoreError::FeedClosed);
                }
            };

            if message.id.sequence() <= self.head {
                continue;
            }
            if !channel_matches(self.channels.as_deref(), &message.channel) {
                continue;
            }
            return Ok(Some(self.event(message)));
        }
    }

    fn resume_position(&self) -> Option<ResumePosition> {
        Some(encode_position(self.position))
    }

    async fn close(&mut self) -> Result<()> {
        self.receiver = None;
        self.backlog.clear();
        Ok(())
    }
}
