//! Shared helpers and scenarios for relay integration tests.
//!
//! Scenarios take a started `Relay` and a channel prefix so the same checks
//! run against the in-memory store and a live MongoDB.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use docrelay::{Callback, ListenerState, Relay};

/// How long a test waits for an expected delivery.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a test waits to be sure nothing else arrives.
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// Payloads received by one callback.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<String>,
}

impl Inbox {
    pub async fn recv_within(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }

    pub async fn expect(&mut self) -> String {
        self.recv_within(DELIVERY_TIMEOUT)
            .await
            .expect("expected a delivery")
    }

    pub async fn assert_quiet(&mut self) {
        if let Some(payload) = self.recv_within(QUIET_PERIOD).await {
            panic!("unexpected delivery: {}", payload);
        }
    }
}

/// Callback that forwards every payload into an `Inbox`.
pub fn recorder() -> (Callback, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = Callback::new(move |payload| {
        let _ = tx.send(payload.to_string());
    });
    (callback, Inbox { rx })
}

/// Wait until the relay's listener is reading from a source.
pub async fn wait_active(relay: &Relay) {
    tokio::time::timeout(DELIVERY_TIMEOUT, async {
        loop {
            if let Some(ListenerState::Active(_)) = relay.listener_state() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("listener never became active");
}

pub async fn scenario_single_channel(relay: &Relay, prefix: &str) {
    let chat = format!("{}chat", prefix);
    let other = format!("{}other", prefix);

    let (chat_cb, mut chat_inbox) = recorder();
    let (other_cb, mut other_inbox) = recorder();
    relay.subscribe(&chat, chat_cb, None);
    relay.subscribe(&other, other_cb, None);
    wait_active(relay).await;

    assert!(relay.broadcast(&chat, "hello world").await);

    assert_eq!(chat_inbox.expect().await, "hello world");
    chat_inbox.assert_quiet().await;
    other_inbox.assert_quiet().await;
}

pub async fn scenario_two_channels(relay: &Relay, prefix: &str) {
    let channel1 = format!("{}channel1", prefix);
    let channel2 = format!("{}channel2", prefix);

    let (cb1, mut inbox1) = recorder();
    let (cb2, mut inbox2) = recorder();
    relay.subscribe(&channel1, cb1, None);
    relay.subscribe(&channel2, cb2, None);
    wait_active(relay).await;

    assert!(relay.broadcast(&channel1, "m1").await);
    assert!(relay.broadcast(&channel2, "m2").await);

    assert_eq!(inbox1.expect().await, "m1");
    assert_eq!(inbox2.expect().await, "m2");
    inbox1.assert_quiet().await;
    inbox2.assert_quiet().await;
}

pub async fn scenario_sequential_order(relay: &Relay, prefix: &str) {
    let channel = format!("{}seq", prefix);
    let (cb, mut inbox) = recorder();
    relay.subscribe(&channel, cb, None);
    wait_active(relay).await;

    for i in 0..10 {
        assert!(relay.broadcast(&channel, &format!("m{}", i)).await);
    }

    for i in 0..10 {
        assert_eq!(inbox.expect().await, format!("m{}", i));
    }
    inbox.assert_quiet().await;
}

pub async fn scenario_unsubscribe(relay: &Relay, prefix: &str) {
    let channel = format!("{}news", prefix);
    let (kept, mut kept_inbox) = recorder();
    let (removed, mut removed_inbox) = recorder();
    relay.subscribe(&channel, kept, None);
    relay.subscribe(&channel, removed.clone(), None);
    wait_active(relay).await;

    relay.unsubscribe(&channel, &removed);
    assert!(relay.broadcast(&channel, "after unsubscribe").await);

    assert_eq!(kept_inbox.expect().await, "after unsubscribe");
    removed_inbox.assert_quiet().await;
}

pub async fn scenario_multiple_callbacks(relay: &Relay, prefix: &str) {
    let channel = format!("{}fanout", prefix);
    let mut inboxes = Vec::new();
    for _ in 0..3 {
        let (cb, inbox) = recorder();
        relay.subscribe(&channel, cb, None);
        inboxes.push(inbox);
    }
    wait_active(relay).await;

    assert!(relay.broadcast(&channel, "to all").await);

    for inbox in &mut inboxes {
        assert_eq!(inbox.expect().await, "to all");
    }
}

pub async fn scenario_on_subscribed(relay: &Relay, prefix: &str) {
    let channel = format!("{}confirm", prefix);
    let confirmed = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let counter = confirmed.clone();
        let (cb, _inbox) = recorder();
        relay.subscribe(
            &channel,
            cb,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
    }

    // Confirmed synchronously, once per subscribe, even for an existing channel.
    assert_eq!(confirmed.load(Ordering::SeqCst), 2);
}
