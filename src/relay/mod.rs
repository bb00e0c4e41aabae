//! Relay adapter.
//!
//! Owns the store gateway, the subscriber registry and a lazily started
//! listener. This is the surface a host pub/sub framework calls into:
//! `broadcast`, `subscribe`, `unsubscribe` and `shutdown`.
//!
//! Delivery to local subscribers is at-least-once. A listener reconnect may
//! hand a message to subscribers a second time; callbacks that care must
//! deduplicate themselves.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ListenerConfig, RelayConfig};
use crate::dispatch::DispatchContext;
use crate::listener::{Listener, ListenerState};
use crate::observe::{Observer, RelayEvent, TracingObserver};
use crate::registry::{Callback, OnSubscribed, SubscriberRegistry};
use crate::store::{MessageStore, StoreError};

/// Errors from relay construction and lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Store topology does not support a change feed and one is required")]
    ChangeFeedRequired,

    #[error("Relay has been shut down")]
    ShutDown,
}

struct ListenerSlot {
    listener: Option<Listener>,
    shut_down: bool,
}

/// Cross-process pub/sub over a shared message store.
pub struct Relay {
    store: Arc<dyn MessageStore>,
    registry: Arc<SubscriberRegistry>,
    observer: Arc<dyn Observer>,
    listener_config: ListenerConfig,
    runtime: Handle,
    slot: Mutex<ListenerSlot>,
}

impl Relay {
    /// Validate `config`, provision the schema and check the store topology.
    ///
    /// Schema errors are logged and tolerated. A store without a change feed
    /// is fatal only when `listener.require_change_feed` is set; otherwise
    /// the listener polls.
    ///
    /// Must be called from within a tokio runtime; the listener is spawned
    /// on that runtime.
    pub async fn new(
        store: Arc<dyn MessageStore>,
        dispatcher: Arc<dyn DispatchContext>,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        config.validate()?;

        if let Err(e) = store.ensure_schema().await {
            warn!(error = %e, kind = e.kind(), "Failed to ensure message indexes");
        }

        let required = config.listener.require_change_feed;
        match store.supports_change_feed().await {
            Ok(true) => info!("Store supports change feeds"),
            Ok(false) if required => {
                error!("Store topology lacks a change feed and require_change_feed is set");
                return Err(RelayError::ChangeFeedRequired);
            }
            Ok(false) => {
                warn!("Store topology lacks a change feed, listener will poll");
            }
            Err(e) if required => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Topology check failed, listener will decide on connect");
            }
        }

        Ok(Self {
            store,
            registry: Arc::new(SubscriberRegistry::new(dispatcher)),
            observer: Arc::new(TracingObserver),
            listener_config: config.listener,
            runtime: Handle::current(),
            slot: Mutex::new(ListenerSlot {
                listener: None,
                shut_down: false,
            }),
        })
    }

    /// Replace the default `TracingObserver`.
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    fn slot(&self) -> MutexGuard<'_, ListenerSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the listener if it is not already running.
    ///
    /// Concurrent callers construct exactly one listener. Fails once the
    /// relay has been shut down.
    pub fn start_listener(&self) -> Result<(), RelayError> {
        let mut slot = self.slot();
        if slot.shut_down {
            return Err(RelayError::ShutDown);
        }
        if slot.listener.is_none() {
            slot.listener = Some(Listener::spawn(
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                Arc::clone(&self.observer),
                &self.listener_config,
                &self.runtime,
            ));
        }
        Ok(())
    }

    fn ensure_listener(&self, operation: &'static str) {
        if let Err(e) = self.start_listener() {
            warn!(operation, error = %e, "Listener not started");
        }
    }

    /// Persist `payload` on `channel` for every process watching the store.
    ///
    /// Returns false if the store rejected the insert. Failed broadcasts are
    /// not retried.
    pub async fn broadcast(&self, channel: &str, payload: &str) -> bool {
        self.ensure_listener("broadcast");

        let ok = match self.store.insert(channel, payload).await {
            Ok(id) => {
                debug!(channel = %channel, id = %id, "Broadcast stored");
                true
            }
            Err(e) => {
                error!(channel = %channel, error = %e, kind = e.kind(), "Broadcast failed");
                false
            }
        };

        self.observer.on_event(&RelayEvent::Broadcast {
            channel: channel.to_string(),
            bytes: payload.len(),
            ok,
        });
        ok
    }

    /// Register `callback` for messages on `channel`.
    ///
    /// `on_subscribed` runs before this returns. Messages are delivered
    /// through the dispatch context.
    pub fn subscribe(&self, channel: &str, callback: Callback, on_subscribed: Option<OnSubscribed>) {
        self.ensure_listener("subscribe");

        let membership = self
            .registry
            .add_subscriber(channel, callback, on_subscribed);
        if membership.changed {
            self.observer.on_event(&RelayEvent::Subscribed {
                channel: channel.to_string(),
                channels: membership.channels,
            });
        }
    }

    /// Remove exactly `callback` from `channel`. No-op if it was not registered.
    pub fn unsubscribe(&self, channel: &str, callback: &Callback) {
        let membership = self.registry.remove_subscriber(channel, callback);
        if membership.changed {
            self.observer.on_event(&RelayEvent::Unsubscribed {
                channel: channel.to_string(),
                channels: membership.channels,
            });
        }
    }

    /// Stop the listener, waiting up to the configured grace period.
    ///
    /// Safe when no listener was ever started and safe to repeat.
    pub async fn shutdown(&self) {
        let listener = {
            let mut slot = self.slot();
            slot.shut_down = true;
            slot.listener.take()
        };

        match listener {
            Some(listener) => listener.shutdown().await,
            None => debug!("Relay shut down with no listener running"),
        }
    }

    /// Current listener state, or `None` if no listener is running.
    pub fn listener_state(&self) -> Option<ListenerState> {
        self.slot().listener.as_ref().map(Listener::state)
    }
}
