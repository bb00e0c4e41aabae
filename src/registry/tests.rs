use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::*;
use crate::dispatch::Job;

/// Runs jobs immediately and records how many were posted.
#[derive(Default)]
struct RecordingDispatch {
    posted: AtomicUsize,
}

impl DispatchContext for RecordingDispatch {
    fn post(&self, job: Job) {
        self.posted.fetch_add(1, Ordering::SeqCst);
        job();
    }
}

fn registry() -> (SubscriberRegistry, Arc<RecordingDispatch>) {
    let dispatch = Arc::new(RecordingDispatch::default());
    (SubscriberRegistry::new(dispatch.clone()), dispatch)
}

fn recorder() -> (Callback, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback = Callback::new(move |payload| sink.lock().unwrap().push(payload.to_string()));
    (callback, seen)
}

#[test]
fn test_notify_unknown_channel_is_noop() {
    let (registry, dispatch) = registry();
    assert_eq!(registry.notify("nobody", "hello"), 0);
    assert_eq!(dispatch.posted.load(Ordering::SeqCst), 0);
}

#[test]
fn test_notify_goes_through_dispatch_context() {
    let (registry, dispatch) = registry();
    let (callback, seen) = recorder();

    registry.add_subscriber("chat", callback, None);
    assert_eq!(registry.notify("chat", "hello world"), 1);

    assert_eq!(dispatch.posted.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock().unwrap(), vec!["hello world".to_string()]);
}

#[test]
fn test_all_callbacks_on_channel_receive_payload() {
    let (registry, _) = registry();
    let (first, first_seen) = recorder();
    let (second, second_seen) = recorder();

    registry.add_subscriber("chat", first, None);
    registry.add_subscriber("chat", second, None);
    assert_eq!(registry.notify("chat", "m"), 2);

    assert_eq!(*first_seen.lock().unwrap(), vec!["m".to_string()]);
    assert_eq!(*second_seen.lock().unwrap(), vec!["m".to_string()]);
}

#[test]
fn test_no_cross_channel_delivery() {
    let (registry, _) = registry();
    let (one, one_seen) = recorder();
    let (two, two_seen) = recorder();

    registry.add_subscriber("channel1", one, None);
    registry.add_subscriber("channel2", two, None);
    registry.notify("channel1", "m1");
    registry.notify("channel2", "m2");

    assert_eq!(*one_seen.lock().unwrap(), vec!["m1".to_string()]);
    assert_eq!(*two_seen.lock().unwrap(), vec!["m2".to_string()]);
}

#[test]
fn test_on_subscribed_runs_once_per_registration() {
    let (registry, _) = registry();
    let confirmations = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let (callback, _) = recorder();
        let counter = confirmations.clone();
        registry.add_subscriber(
            "chat",
            callback,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
    }

    assert_eq!(confirmations.load(Ordering::SeqCst), 2);
    assert_eq!(registry.subscriber_count("chat"), 2);
}

#[test]
fn test_remove_exact_callback() {
    let (registry, _) = registry();
    let (kept, kept_seen) = recorder();
    let (removed, removed_seen) = recorder();

    registry.add_subscriber("chat", kept, None);
    registry.add_subscriber("chat", removed.clone(), None);
    registry.remove_subscriber("chat", &removed);
    registry.notify("chat", "after");

    assert_eq!(*kept_seen.lock().unwrap(), vec!["after".to_string()]);
    assert!(removed_seen.lock().unwrap().is_empty());
}

#[test]
fn test_remove_absent_is_noop() {
    let (registry, _) = registry();
    let (subscribed, _) = recorder();
    let (stranger, _) = recorder();

    registry.add_subscriber("chat", subscribed, None);
    let unchanged = Membership {
        changed: false,
        channels: 1,
    };
    assert_eq!(registry.remove_subscriber("chat", &stranger), unchanged);
    assert_eq!(registry.remove_subscriber("other", &stranger), unchanged);
    assert_eq!(registry.subscriber_count("chat"), 1);
}

#[test]
fn test_entry_exists_only_with_callbacks() {
    let (registry, _) = registry();
    let (callback, _) = recorder();

    assert_eq!(registry.add_subscriber("chat", callback.clone(), None).channels, 1);
    assert_eq!(registry.channels(), vec!["chat".to_string()]);

    let removed = registry.remove_subscriber("chat", &callback);
    assert!(removed.changed);
    assert_eq!(removed.channels, 0);
    assert!(registry.channels().is_empty());
    assert_eq!(registry.channel_count(), 0);
}

#[test]
fn test_duplicate_registration_is_ignored() {
    let (registry, _) = registry();
    let (callback, seen) = recorder();

    assert!(registry.add_subscriber("chat", callback.clone(), None).changed);
    assert!(!registry.add_subscriber("chat", callback, None).changed);
    registry.notify("chat", "once");

    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_generation_changes_with_channel_set() {
    let (registry, _) = registry();
    let watcher = registry.watch_channels();
    let (first, _) = recorder();
    let (second, _) = recorder();

    registry.add_subscriber("chat", first.clone(), None);
    assert_eq!(*watcher.borrow(), 1);

    // Second callback on an existing channel leaves the set unchanged.
    registry.add_subscriber("chat", second.clone(), None);
    assert_eq!(*watcher.borrow(), 1);

    registry.remove_subscriber("chat", &first);
    assert_eq!(*watcher.borrow(), 1);

    registry.remove_subscriber("chat", &second);
    assert_eq!(*watcher.borrow(), 2);
}

#[test]
fn test_concurrent_subscribe_and_notify() {
    let (registry, _) = registry();
    let registry = Arc::new(registry);
    let delivered = Arc::new(AtomicUsize::new(0));

    let writers: Vec<_> = (0..8)
        .map(|i| {
            let registry = registry.clone();
            let delivered = delivered.clone();
            std::thread::spawn(move || {
                let callback = Callback::new(move |_| {
                    delivered.fetch_add(1, Ordering::SeqCst);
                });
                let channel = format!("c{}", i % 2);
                registry.add_subscriber(&channel, callback.clone(), None);
                registry.notify(&channel, "x");
                registry.remove_subscriber(&channel, &callback);
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }

    assert!(delivered.load(Ordering::SeqCst) >= 8);
    assert_eq!(registry.channel_count(), 0);
}
