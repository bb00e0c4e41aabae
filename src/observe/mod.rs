//! Observability events.
//!
//! Advisory notifications for external monitoring. Observers never influence
//! control flow; a slow observer only slows the call site that emitted the event.

use std::sync::Arc;

use tracing::debug;

#[cfg(feature = "otel")]
mod metrics;

#[cfg(feature = "otel")]
pub use metrics::MetricsObserver;

/// Event emitted by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A broadcast was attempted.
    Broadcast {
        channel: String,
        bytes: usize,
        ok: bool,
    },
    /// A stored message was handed to local subscribers.
    Delivered {
        channel: String,
        bytes: usize,
        subscribers: usize,
    },
    /// A callback was registered.
    Subscribed { channel: String, channels: usize },
    /// A callback was removed.
    Unsubscribed { channel: String, channels: usize },
}

/// Sink for relay events.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &RelayEvent);
}

/// Logs every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &RelayEvent) {
        match event {
            RelayEvent::Broadcast { channel, bytes, ok } => {
                debug!(channel = %channel, bytes, ok, "relay.broadcast");
            }
            RelayEvent::Delivered {
                channel,
                bytes,
                subscribers,
            } => {
                debug!(channel = %channel, bytes, subscribers, "relay.delivered");
            }
            RelayEvent::Subscribed { channel, channels } => {
                debug!(channel = %channel, channels, "relay.subscribed");
            }
            RelayEvent::Unsubscribed { channel, channels } => {
                debug!(channel = %channel, channels, "relay.unsubscribed");
            }
        }
    }
}

/// Forwards each event to several observers.
#[derive(Default, Clone)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl Observer for FanoutObserver {
    fn on_event(&self, event: &RelayEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<RelayEvent>>);

    impl Observer for Collecting {
        fn on_event(&self, event: &RelayEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_fanout_reaches_every_observer() {
        let a = Arc::new(Collecting::default());
        let b = Arc::new(Collecting::default());
        let fanout = FanoutObserver::new()
            .with(a.clone())
            .with(Arc::new(TracingObserver))
            .with(b.clone());

        let event = RelayEvent::Subscribed {
            channel: "chat".to_string(),
            channels: 1,
        };
        fanout.on_event(&event);

        assert_eq!(*a.0.lock().unwrap(), vec![event.clone()]);
        assert_eq!(*b.0.lock().unwrap(), vec![event]);
    }
}
