//! Integration tests for EventSource
//!
//! These tests cover:
//! - Delivery order and last-event replay
//! - Unsubscribing from inside a notification
//! - One-shot waiting (wait_for_next_event)
//! - Bridging a stream into a promise (to_promise / to_promise_when)
//! - Progress event sources

use deferred_kernel::core::{EventSource, ProgressEvent, ProgressEventSource, ProgressKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn recorder() -> (Arc<Mutex<Vec<i32>>>, impl Fn(&EventSource<i32>, &i32) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |_: &EventSource<i32>, event: &i32| sink.lock().push(*event))
}

// ============================================================================
// DELIVERY
// ============================================================================

#[test]
fn test_observers_receive_in_subscription_order() {
    let source = EventSource::<i32>::new();
    let order = Arc::new(Mutex::new(String::new()));
    for tag in ["a", "b", "c"] {
        let order = Arc::clone(&order);
        source.subscribe(move |_: &EventSource<i32>, _: &i32| order.lock().push_str(tag));
    }
    source.notify(1);
    assert_eq!(order.lock().as_str(), "abc");
    assert_eq!(source.observer_count(), 3);
}

#[test]
fn test_subscribe_replays_last_event() {
    let source = EventSource::<i32>::new();
    source.notify(7);
    let (seen, observer) = recorder();
    source.subscribe(observer);
    assert_eq!(*seen.lock(), vec![7]);

    source.notify(8);
    assert_eq!(*seen.lock(), vec![7, 8]);
    assert_eq!(source.last_event(), Some(8));
}

#[test]
fn test_subscribe_without_replay() {
    let source = EventSource::<i32>::new();
    source.notify(7);
    let (seen, observer) = recorder();
    source.subscribe_with(observer, false);
    assert!(seen.lock().is_empty());
    source.notify(9);
    assert_eq!(*seen.lock(), vec![9]);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let source = EventSource::<i32>::new();
    let (seen, observer) = recorder();
    let id = source.subscribe(observer);
    source.notify(1);
    assert!(source.unsubscribe(id));
    assert!(!source.unsubscribe(id));
    source.notify(2);
    assert_eq!(*seen.lock(), vec![1]);
}

#[test]
fn test_observer_can_unsubscribe_itself_during_notify() {
    let source = EventSource::<i32>::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let slot = Arc::new(Mutex::new(None));

    let counter = Arc::clone(&calls);
    let own_id = Arc::clone(&slot);
    let id = source.subscribe(move |source: &EventSource<i32>, _: &i32| {
        counter.fetch_add(1, Ordering::SeqCst);
        if let Some(id) = *own_id.lock() {
            source.unsubscribe(id);
        }
    });
    *slot.lock() = Some(id);

    let (seen, observer) = recorder();
    source.subscribe(observer);

    source.notify(1);
    source.notify(2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock(), vec![1, 2]);
}

#[test]
fn test_filter_forwards_matching_events() {
    let source = EventSource::<i32>::new();
    let evens = source.filter(|event| event % 2 == 0);
    let (seen, observer) = recorder();
    evens.subscribe(observer);
    for event in 1..=6 {
        source.notify(event);
    }
    assert_eq!(*seen.lock(), vec![2, 4, 6]);
}

// ============================================================================
// ONE-SHOT AND PROMISE BRIDGES
// ============================================================================

#[test]
fn test_wait_for_next_event_fires_once_without_replay() {
    let source = EventSource::<i32>::new();
    source.notify(1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    source.wait_for_next_event(move |event| sink.lock().push(*event));

    assert!(seen.lock().is_empty());
    source.notify(2);
    source.notify(3);
    assert_eq!(*seen.lock(), vec![2]);
    assert_eq!(source.observer_count(), 0);
}

#[test]
fn test_to_promise_completes_from_replay() {
    let source = EventSource::<i32>::new();
    source.notify(5);
    let promise = source.to_promise(|event: &i32, completer| {
        completer.complete(event * 10);
    });
    assert_eq!(promise.result(), Some(50));
    assert_eq!(source.observer_count(), 0);
}

#[test]
fn test_to_promise_when_waits_for_match() {
    let source = EventSource::<i32>::new();
    let promise = source.to_promise_when(|event| (*event > 2).then(|| format!("got {event}")));
    source.notify(1);
    source.notify(2);
    assert!(!promise.is_settled());
    source.notify(3);
    source.notify(4);
    assert_eq!(promise.result().as_deref(), Some("got 3"));
    assert_eq!(source.observer_count(), 0);
}

#[test]
fn test_to_promise_completed_from_another_thread() {
    let source = EventSource::<i32>::new();
    let promise = source.to_promise(|event: &i32, completer| {
        if *event == 42 {
            completer.complete(*event);
        }
    });
    let publisher = {
        let source = source.clone();
        thread::spawn(move || {
            for event in 40..45 {
                source.notify(event);
            }
        })
    };
    assert_eq!(promise.join_timeout(Duration::from_secs(5)).unwrap(), 42);
    publisher.join().unwrap();
}

// ============================================================================
// PROGRESS
// ============================================================================

#[test]
fn test_progress_source_reports_completion() {
    let progress = ProgressEventSource::new();
    let done = progress.on_complete_promise();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    progress.subscribe(move |event: &ProgressEvent| sink.lock().push(event.kind));

    progress.notify(ProgressEvent::message("starting"));
    progress.notify(ProgressEvent::progress(2, 1, 0, 1));
    assert!(!progress.is_completed());
    progress.notify(ProgressEvent::progress(2, 2, 0, 0));

    assert!(progress.is_completed());
    assert_eq!(done.result(), Some(true));
    assert_eq!(
        *kinds.lock(),
        vec![ProgressKind::Message, ProgressKind::Progress, ProgressKind::Completed]
    );
}
