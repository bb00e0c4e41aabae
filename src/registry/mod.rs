//! Local subscriber registry.
//!
//! Maps channel names to the callbacks registered in this process. Reads
//! happen on the listener worker for every delivered message; writes come
//! from arbitrary caller threads through `subscribe`/`unsubscribe`, so the map
//! sits behind an `RwLock`. Callbacks are never run under the lock and never
//! on the caller of `notify`: each delivery is posted to the dispatch context.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::dispatch::DispatchContext;

/// One-shot confirmation invoked when a subscription is registered.
pub type OnSubscribed = Box<dyn FnOnce() + Send + 'static>;

/// A subscriber callback with a stable identity.
///
/// Clones share the identity, so the value handed to `subscribe` can later be
/// passed to `unsubscribe` to remove exactly that registration.
#[derive(Clone)]
pub struct Callback {
    id: Uuid,
    handler: Arc<dyn Fn(&str) + Send + Sync>,
}

impl Callback {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            handler: Arc::new(handler),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn invoke(&self, payload: &str) {
        (self.handler)(payload)
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Callback {}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("id", &self.id).finish()
    }
}

/// Outcome of a registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    /// Whether a callback was actually added or removed.
    pub changed: bool,
    /// Channels with at least one subscriber afterwards.
    pub channels: usize,
}

/// Per-channel callback sets.
///
/// A channel has an entry exactly when at least one callback is registered.
pub struct SubscriberRegistry {
    channels: RwLock<HashMap<String, Vec<Callback>>>,
    dispatcher: Arc<dyn DispatchContext>,
    /// Bumped whenever a channel entry is created or removed.
    generation: watch::Sender<u64>,
}

impl SubscriberRegistry {
    pub fn new(dispatcher: Arc<dyn DispatchContext>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            channels: RwLock::new(HashMap::new()),
            dispatcher,
            generation,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Callback>>> {
        self.channels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Callback>>> {
        self.channels.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `callback` under `channel`.
    ///
    /// `on_subscribed` runs exactly once, synchronously, whether or not the
    /// channel already had subscribers. Registering the same callback twice
    /// leaves the registry unchanged.
    pub fn add_subscriber(
        &self,
        channel: &str,
        callback: Callback,
        on_subscribed: Option<OnSubscribed>,
    ) -> Membership {
        let (created, added, channel_count) = {
            let mut channels = self.write();
            let created = !channels.contains_key(channel);
            let callbacks = channels.entry(channel.to_string()).or_default();
            let added = !callbacks.contains(&callback);
            if added {
                callbacks.push(callback);
            }
            (created, added, channels.len())
        };

        if created {
            self.generation.send_modify(|g| *g += 1);
        }

        debug!(channel = %channel, channels = channel_count, added, "Subscriber added");

        if let Some(confirm) = on_subscribed {
            confirm();
        }

        Membership {
            changed: added,
            channels: channel_count,
        }
    }

    /// Remove exactly `callback` from `channel`. No-op if absent.
    pub fn remove_subscriber(&self, channel: &str, callback: &Callback) -> Membership {
        let (removed, removed_channel, channel_count) = {
            let mut channels = self.write();
            let mut removed = false;
            let mut removed_channel = false;
            if let Some(callbacks) = channels.get_mut(channel) {
                let before = callbacks.len();
                callbacks.retain(|c| c != callback);
                removed = callbacks.len() < before;
                if callbacks.is_empty() {
                    channels.remove(channel);
                    removed_channel = true;
                }
            }
            (removed, removed_channel, channels.len())
        };

        if removed_channel {
            self.generation.send_modify(|g| *g += 1);
        }

        if removed {
            debug!(channel = %channel, channels = channel_count, "Subscriber removed");
        }
        Membership {
            changed: removed,
            channels: channel_count,
        }
    }

    /// Deliver `payload` to every callback on `channel` via the dispatch context.
    ///
    /// Unknown channels are a no-op. Returns the number of callbacks posted.
    pub fn notify(&self, channel: &str, payload: &str) -> usize {
        let callbacks = match self.read().get(channel) {
            Some(callbacks) => callbacks.clone(),
            None => return 0,
        };

        let payload: Arc<str> = Arc::from(payload);
        for callback in &callbacks {
            let callback = callback.clone();
            let payload = Arc::clone(&payload);
            self.dispatcher
                .post(Box::new(move || callback.invoke(&payload)));
        }

        callbacks.len()
    }

    /// Channels with at least one subscriber, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn channel_count(&self) -> usize {
        self.read().len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.read().get(channel).map(Vec::len).unwrap_or(0)
    }

    /// Receiver that changes whenever the set of channels changes.
    pub fn watch_channels(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

#[cfg(test)]
mod tests;
