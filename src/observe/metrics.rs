//! OTel-native metrics for relay events.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
use opentelemetry::{global, KeyValue};

use super::{Observer, RelayEvent};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("docrelay"));

/// Total broadcast attempts, labelled by outcome.
static BROADCAST_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("docrelay.broadcast.total")
        .with_description("Total broadcast attempts")
        .build()
});

/// Total messages handed to local subscribers.
static DELIVERY_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("docrelay.delivery.total")
        .with_description("Total messages delivered to local subscribers")
        .build()
});

/// Active local subscriptions.
static SUBSCRIPTIONS: LazyLock<UpDownCounter<i64>> = LazyLock::new(|| {
    METER
        .i64_up_down_counter("docrelay.subscriptions")
        .with_description("Active local subscriptions")
        .build()
});

/// One instrument update derived from a relay event.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Measurement {
    Broadcast { outcome: &'static str },
    Delivery { count: u64 },
    Subscriptions { delta: i64 },
}

fn measure(event: &RelayEvent) -> (Measurement, &str) {
    match event {
        RelayEvent::Broadcast { channel, ok, .. } => (
            Measurement::Broadcast {
                outcome: if *ok { "success" } else { "failure" },
            },
            channel,
        ),
        RelayEvent::Delivered {
            channel,
            subscribers,
            ..
        } => (
            Measurement::Delivery {
                count: *subscribers as u64,
            },
            channel,
        ),
        RelayEvent::Subscribed { channel, .. } => {
            (Measurement::Subscriptions { delta: 1 }, channel)
        }
        RelayEvent::Unsubscribed { channel, .. } => {
            (Measurement::Subscriptions { delta: -1 }, channel)
        }
    }
}

/// Records relay events as OpenTelemetry metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl Observer for MetricsObserver {
    fn on_event(&self, event: &RelayEvent) {
        let (measurement, channel) = measure(event);
        let channel = KeyValue::new("channel", channel.to_string());
        match measurement {
            Measurement::Broadcast { outcome } => {
                BROADCAST_TOTAL.add(1, &[channel, KeyValue::new("outcome", outcome)])
            }
            Measurement::Delivery { count } => DELIVERY_TOTAL.add(count, &[channel]),
            Measurement::Subscriptions { delta } => SUBSCRIPTIONS.add(delta, &[channel]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_outcome_label() {
        let ok = RelayEvent::Broadcast {
            channel: "chat".to_string(),
            bytes: 5,
            ok: true,
        };
        let failed = RelayEvent::Broadcast {
            channel: "chat".to_string(),
            bytes: 5,
            ok: false,
        };

        assert_eq!(
            measure(&ok),
            (Measurement::Broadcast { outcome: "success" }, "chat")
        );
        assert_eq!(
            measure(&failed),
            (Measurement::Broadcast { outcome: "failure" }, "chat")
        );
    }

    #[test]
    fn test_delivery_counts_subscribers() {
        let event = RelayEvent::Delivered {
            channel: "chat".to_string(),
            bytes: 5,
            subscribers: 3,
        };

        assert_eq!(measure(&event), (Measurement::Delivery { count: 3 }, "chat"));
    }

    #[test]
    fn test_subscription_events_balance() {
        let subscribed = RelayEvent::Subscribed {
            channel: "chat".to_string(),
            channels: 1,
        };
        let unsubscribed = RelayEvent::Unsubscribed {
            channel: "chat".to_string(),
            channels: 0,
        };

        let delta = |event: &RelayEvent| match measure(event) {
            (Measurement::Subscriptions { delta }, _) => delta,
            other => panic!("unexpected measurement {other:?}"),
        };
        assert_eq!(delta(&subscribed) + delta(&unsubscribed), 0);
    }

    #[test]
    fn test_records_without_installed_provider() {
        let observer = MetricsObserver;
        observer.on_event(&RelayEvent::Broadcast {
            channel: "chat".to_string(),
            bytes: 5,
            ok: true,
        });
        observer.on_event(&RelayEvent::Subscribed {
            channel: "chat".to_string(),
            channels: 1,
        });
    }
}
