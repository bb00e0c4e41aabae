//! Background listener.
//!
//! One tokio task per `Listener`. The task selects an `EventSource`, reads new
//! messages from the store and hands each one to the `SubscriberRegistry`.
//! Failures close the source and back off before the next connect; the
//! capability check runs again on every connect, so a store that gains a
//! change feed is picked up without a restart.
//!
//! ```text
//! Connecting -> Active(change_feed | polling) -> Backoff -> Connecting -> ...
//!      \______________ ShuttingDown (from any state) -> Stopped
//! ```
//!
//! Delivery is at-least-once: a reconnect resumes from the last recorded
//! position, so a message dispatched before its position was recorded can be
//! delivered again.

pub mod source;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::observe::{Observer, RelayEvent};
use crate::registry::SubscriberRegistry;
use crate::store::{Message, MessageStore, StoreError};
use crate::utils::retry::ReconnectPolicy;

pub use source::{Batch, ChangeFeedReader, EventSource, PollingReader, Position, SourceKind, Step};

/// Errors that end an active read session.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),
}

impl ListenerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(e) => e.kind(),
            Self::Dispatch(_) => "dispatch",
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Dispatch(_) => false,
        }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Probing the store and opening a source.
    Connecting,
    /// Reading from the given source.
    Active(SourceKind),
    /// Waiting `delay` after a failure. `attempt` is the 0-based failure count.
    Backoff { attempt: u32, delay: Duration },
    /// Shutdown requested; the worker is exiting.
    ShuttingDown,
    /// The worker has exited.
    Stopped,
}

#[derive(Debug, Clone)]
struct Settings {
    policy: ReconnectPolicy,
    poll_interval: Duration,
    batch_limit: usize,
    read_max_wait: Duration,
    filter_channels: bool,
}

impl From<&ListenerConfig> for Settings {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            policy: config.reconnect_policy(),
            poll_interval: config.poll_interval(),
            batch_limit: config.batch_limit,
            read_max_wait: config.read_max_wait(),
            filter_channels: config.filter_channels,
        }
    }
}

/// Handle to the background worker.
pub struct Listener {
    shutdown: watch::Sender<bool>,
    state: Arc<watch::Sender<ListenerState>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

impl Listener {
    /// Start the worker on `runtime`.
    pub fn spawn(
        store: Arc<dyn MessageStore>,
        registry: Arc<SubscriberRegistry>,
        observer: Arc<dyn Observer>,
        config: &ListenerConfig,
        runtime: &Handle,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state, _) = watch::channel(ListenerState::Connecting);
        let state = Arc::new(state);
        let running = Arc::new(AtomicBool::new(true));

        let worker = Worker {
            channels_changed: registry.watch_channels(),
            store,
            registry,
            observer,
            settings: Settings::from(config),
            shutdown: shutdown_rx,
            state: Arc::clone(&state),
            running: Arc::clone(&running),
            position: Position::default(),
            attempt: 0,
        };

        let handle = runtime.spawn(worker.run());

        Self {
            shutdown,
            state,
            running,
            handle: Mutex::new(Some(handle)),
            grace: config.shutdown_grace(),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop and wait up to the grace period for it to exit.
    ///
    /// A worker still running after the grace period is aborted. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(mut handle) = handle else {
            return;
        };

        info!("Listener shutting down");
        self.running.store(false, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if *state == ListenerState::Stopped {
                return false;
            }
            *state = ListenerState::ShuttingDown;
            true
        });
        // Err only if the worker already exited.
        let _ = self.shutdown.send(true);

        match tokio::time::timeout(self.grace, &mut handle).await {
            Ok(Ok(())) => info!("Listener stopped"),
            Ok(Err(e)) => warn!(error = %e, "Listener task ended abnormally"),
            Err(_) => {
                warn!(
                    grace_ms = self.grace.as_millis() as u64,
                    "Listener did not stop within grace period, aborting"
                );
                handle.abort();
            }
        }

        self.state.send_replace(ListenerState::Stopped);
    }
}

/// Why an active session ended.
enum Exit {
    Shutdown,
    /// Reopen immediately, without penalty.
    Reconnect(&'static str),
    /// Back off, then reopen.
    Failed(ListenerError),
}

struct Worker {
    store: Arc<dyn MessageStore>,
    registry: Arc<SubscriberRegistry>,
    observer: Arc<dyn Observer>,
    settings: Settings,
    shutdown: watch::Receiver<bool>,
    channels_changed: watch::Receiver<u64>,
    state: Arc<watch::Sender<ListenerState>>,
    running: Arc<AtomicBool>,
    position: Position,
    attempt: u32,
}

impl Worker {
    async fn run(mut self) {
        info!(
            batch_limit = self.settings.batch_limit,
            filter_channels = self.settings.filter_channels,
            "Listener started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.publish(ListenerState::Connecting);
            info!(attempt = self.attempt, "Listener connecting");

            let connected = tokio::select! {
                biased;
                _ = shutdown_signal(self.shutdown.clone()) => None,
                result = self.connect() => Some(result),
            };

            let exit = match connected {
                None => Exit::Shutdown,
                Some(Ok(source)) => self.drive(source).await,
                Some(Err(e)) => Exit::Failed(e.into()),
            };

            match exit {
                Exit::Shutdown => break,
                Exit::Reconnect(reason) => {
                    info!(reason, "Reopening event source");
                }
                Exit::Failed(e) => {
                    if !self.backoff(e).await {
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.publish(ListenerState::Stopped);
        info!("Listener exited");
    }

    /// Check the store and open the matching source.
    async fn connect(&mut self) -> Result<EventSource, StoreError> {
        // Changes from here on trigger a refilter.
        let _ = self.channels_changed.borrow_and_update();
        let channels = self.channel_filter();

        self.position.establish(self.store.as_ref()).await?;

        if self.store.supports_change_feed().await? {
            let reader = ChangeFeedReader::open(
                &self.store,
                &self.position,
                channels.as_deref(),
                self.settings.read_max_wait,
                self.settings.batch_limit,
            )
            .await?;
            if let Some(resume) = reader.opened_at() {
                self.position.resume = Some(resume);
            }
            return Ok(EventSource::ChangeFeed(reader));
        }

        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Change feed unavailable, polling"
        );
        // Polling advances past any feed position; an upgrade catches up
        // from the cursor instead.
        self.position.resume = None;
        Ok(EventSource::Polling(PollingReader::new(
            Arc::clone(&self.store),
            self.settings.batch_limit,
            self.settings.poll_interval,
        )))
    }

    /// Read from `source` until shutdown, failure or a reason to reopen.
    async fn drive(&mut self, mut source: EventSource) -> Exit {
        let kind = source.kind();
        self.publish(ListenerState::Active(kind));
        info!(source = %kind, "Listener active");

        let refilter = self.settings.filter_channels && kind == SourceKind::ChangeFeed;

        let exit = loop {
            let channels = match kind {
                SourceKind::Polling => self.channel_filter(),
                SourceKind::ChangeFeed => None,
            };

            let step = tokio::select! {
                biased;
                _ = shutdown_signal(self.shutdown.clone()) => break Exit::Shutdown,
                _ = channels_changed(&mut self.channels_changed), if refilter => {
                    break Exit::Reconnect("subscribed channels changed");
                }
                step = source.next(&self.position, channels.as_deref()) => step,
            };

            match step {
                Ok(Step::Batch(batch)) => {
                    if let Err(e) = self.dispatch(&batch.messages) {
                        break Exit::Failed(e);
                    }
                    if batch.resume.is_some() {
                        self.position.resume = batch.resume;
                    }
                    self.attempt = 0;
                }
                Ok(Step::Idle { resume }) => {
                    if resume.is_some() {
                        self.position.resume = resume;
                    }
                    self.attempt = 0;
                }
                Ok(Step::Upgrade) => break Exit::Reconnect("change feed available"),
                Err(e) => break Exit::Failed(e.into()),
            }
        };

        source.close().await;
        exit
    }

    /// Hand each message to the registry in order, recording the cursor as it goes.
    fn dispatch(&mut self, messages: &[Message]) -> Result<(), ListenerError> {
        for message in messages {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                self.registry.notify(&message.channel, &message.payload)
            }))
            .map_err(|panic| ListenerError::Dispatch(panic_message(panic.as_ref())))?;

            if delivered > 0 {
                self.observer.on_event(&RelayEvent::Delivered {
                    channel: message.channel.clone(),
                    bytes: message.payload.len(),
                    subscribers: delivered,
                });
            }

            debug!(
                id = %message.id,
                channel = %message.channel,
                subscribers = delivered,
                "Message dispatched"
            );
            self.position.last_id = Some(message.id);
        }
        Ok(())
    }

    /// Sleep for the current delay. Returns false if shutdown arrived first.
    async fn backoff(&mut self, e: ListenerError) -> bool {
        if matches!(e, ListenerError::Store(StoreError::ResumeInvalid(_))) {
            warn!("Resume position rejected by store, discarding it");
            self.position.resume = None;
        }

        let attempt = self.attempt;
        let delay = self.settings.policy.delay(attempt);
        self.attempt = self.attempt.saturating_add(1);

        if e.is_transient() {
            warn!(
                error = %e,
                kind = e.kind(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Listener error, backing off"
            );
        } else {
            error!(
                error = %e,
                kind = e.kind(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Unexpected listener error, backing off"
            );
        }

        self.publish(ListenerState::Backoff { attempt, delay });

        tokio::select! {
            biased;
            _ = shutdown_signal(self.shutdown.clone()) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Channels to push down to the store, when filtering is enabled.
    fn channel_filter(&self) -> Option<Vec<String>> {
        self.settings
            .filter_channels
            .then(|| self.registry.channels())
    }

    fn publish(&self, next: ListenerState) {
        self.state.send_if_modified(|state| {
            // Once shutdown is requested only Stopped may follow.
            if *state == next
                || (*state == ListenerState::ShuttingDown && next != ListenerState::Stopped)
            {
                return false;
            }
            *state = next;
            true
        });
    }
}

/// Resolves once shutdown is requested or the handle is dropped.
async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Resolves when the registry's channel set changes. Never resolves once the
/// registry is gone.
async fn channels_changed(changes: &mut watch::Receiver<u64>) {
    if changes.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic during dispatch".to_string()
    }
}
