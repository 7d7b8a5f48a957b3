//! Integration tests for ResourceFetchManager and FetchGroup
//!
//! These tests cover:
//! - The max_concurrent bound under out-of-order settlement
//! - Aggregate progress publication
//! - FetchGroup milestones (begin / end / complete)
//! - Group cancellation and per-group fetchers
//! - Stop / restart of the driver, including a unit resumed after restart
//! - Aggregate progress under concurrent settlement

use deferred_kernel::config::FetchManagerConfig;
use deferred_kernel::core::{
    ContentHandler, Defer, Failure, Fetch, FetchGroup, FetchHandler, PassThrough, ProgressEvent, ProgressKind,
    Promise, ResourceFetchManager, ResourceFetcher,
};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// HELPERS
// ============================================================================

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn fast_config(max_concurrent: usize) -> FetchManagerConfig {
    FetchManagerConfig::new()
        .with_max_concurrent(max_concurrent)
        .with_idle_wait_ms(5)
}

/// Fetcher whose promises stay pending until the test settles them.
#[derive(Default)]
struct ManualFetcher {
    waiting: Mutex<Vec<(String, Defer<String>)>>,
    outstanding: AtomicUsize,
    peak: AtomicUsize,
}

impl ManualFetcher {
    fn waiting(&self) -> usize {
        self.waiting.lock().len()
    }

    fn take_waiting(&self) -> Vec<(String, Defer<String>)> {
        let batch: Vec<_> = self.waiting.lock().drain(..).collect();
        self.outstanding.fetch_sub(batch.len(), Ordering::SeqCst);
        batch
    }

    /// Settle every waiting fetch in random order; keys starting with `!` fail.
    fn settle_all_shuffled(&self) -> usize {
        let mut batch: Vec<_> = self.waiting.lock().drain(..).collect();
        batch.shuffle(&mut rand::rng());
        let count = batch.len();
        for (key, defer) in batch {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            if key.starts_with('!') {
                defer.reject(Failure::msg(format!("cannot fetch {key}")));
            } else {
                defer.resolve(key.to_uppercase());
            }
        }
        count
    }
}

impl ResourceFetcher<String> for ManualFetcher {
    fn fetch(&self, key: &str) -> Promise<String> {
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let defer = Defer::new();
        let promise = defer.promise();
        self.waiting.lock().push((key.to_string(), defer));
        promise
    }
}

fn immediate() -> Arc<dyn ResourceFetcher<String>> {
    Arc::new(|key: &str| {
        if key.starts_with('!') {
            Promise::with_error(Failure::msg("unavailable"))
        } else {
            Promise::with_result(key.to_uppercase())
        }
    })
}

/// Records every FetchGroup milestone.
#[derive(Clone, Default)]
struct Milestones {
    events: Arc<Mutex<Vec<String>>>,
    completions: Arc<Mutex<Vec<(usize, usize, usize)>>>,
}

impl FetchHandler<String> for Milestones {
    fn on_begin_fetch(&self, key: &str) {
        self.events.lock().push(format!("begin:{key}"));
    }

    fn on_end_fetch(&self, key: &str, success: bool) {
        self.events.lock().push(format!("end:{key}:{success}"));
    }

    fn on_complete(&self, total: usize, failed: usize, canceled: usize) {
        self.completions.lock().push((total, failed, canceled));
    }
}

/// Unit of five resources that issues two pending fetches, then panics.
#[derive(Default)]
struct PanicsOnThird {
    issued: Mutex<Vec<Defer<String>>>,
    calls: AtomicUsize,
}

impl Fetch<String> for PanicsOnThird {
    fn total(&self) -> usize {
        5
    }

    fn next(&self, _default_fetcher: &Arc<dyn ResourceFetcher<String>>) -> Option<Promise<String>> {
        assert!(self.calls.fetch_add(1, Ordering::SeqCst) < 2, "unit exploded");
        let defer = Defer::new();
        let promise = defer.promise();
        self.issued.lock().push(defer);
        Some(promise)
    }
}

// ============================================================================
// CONCURRENCY BOUND
// ============================================================================

#[test]
fn test_max_concurrent_never_exceeded() {
    let fetcher = Arc::new(ManualFetcher::default());
    let manager = ResourceFetchManager::new(fast_config(3), Arc::clone(&fetcher) as Arc<dyn ResourceFetcher<String>>)
        .unwrap();
    let done = manager.progress().on_complete_promise();
    let keys: Vec<String> = (0..20).map(|i| format!("k{i}")).collect();
    manager.add(Arc::new(FetchGroup::new(keys, PassThrough)));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !done.is_settled() {
        assert!(Instant::now() < deadline, "fetches never completed");
        assert!(manager.stats().pending <= 3);
        fetcher.settle_all_shuffled();
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(done.result(), Some(true));
    assert!(fetcher.peak.load(Ordering::SeqCst) <= 3);
    let stats = manager.stats();
    assert_eq!((stats.total, stats.completed, stats.failed, stats.pending), (20, 20, 0, 0));
    manager.stop();
}

#[test]
fn test_max_concurrent_holds_across_single_key_units() {
    let fetcher = Arc::new(ManualFetcher::default());
    let manager = ResourceFetchManager::new(fast_config(3), Arc::clone(&fetcher) as Arc<dyn ResourceFetcher<String>>)
        .unwrap();
    let done = manager.progress().on_complete_promise();
    for i in 0..20 {
        manager.add(Arc::new(FetchGroup::single(format!("unit{i}"), PassThrough)));
    }

    wait_until("capacity to fill", || fetcher.waiting() == 3);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(fetcher.waiting(), 3);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !done.is_settled() {
        assert!(Instant::now() < deadline, "units never completed");
        assert!(manager.stats().pending <= 3);
        fetcher.settle_all_shuffled();
        thread::sleep(Duration::from_millis(1));
    }

    assert!(fetcher.peak.load(Ordering::SeqCst) <= 3);
    let stats = manager.stats();
    assert_eq!((stats.total, stats.completed, stats.queued), (20, 20, 0));
    manager.stop();
}

#[test]
fn test_capacity_is_used_when_available() {
    let fetcher = Arc::new(ManualFetcher::default());
    let manager = ResourceFetchManager::new(fast_config(4), Arc::clone(&fetcher) as Arc<dyn ResourceFetcher<String>>)
        .unwrap();
    manager.add(Arc::new(FetchGroup::new(["a", "b", "c", "d", "e", "f"], PassThrough)));

    wait_until("four fetches in flight", || fetcher.waiting() == 4);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(fetcher.waiting(), 4);

    assert_eq!(fetcher.settle_all_shuffled(), 4);
    wait_until("remaining fetches", || fetcher.waiting() == 2);
    fetcher.settle_all_shuffled();
    wait_until("completion", || manager.stats().completed == 6);
    manager.stop();
}

// ============================================================================
// PROGRESS
// ============================================================================

#[test]
fn test_progress_events_are_published() {
    let manager = ResourceFetchManager::new(fast_config(2), immediate()).unwrap();
    let (tx, rx) = flume::unbounded::<ProgressEvent>();
    manager.progress().subscribe(move |event: &ProgressEvent| {
        let _ = tx.send(event.clone());
    });
    let done = manager.progress().on_complete_promise();

    manager.add(Arc::new(FetchGroup::new(["a", "!b", "c"], PassThrough)));
    assert!(!done.join_timeout(Duration::from_secs(5)).unwrap());
    manager.stop();

    let events: Vec<ProgressEvent> = rx.try_iter().collect();
    assert!(!events.is_empty());
    assert!(events.windows(2).all(|pair| pair[0].completed <= pair[1].completed));
    let last = events.last().unwrap();
    assert_eq!(last.kind, ProgressKind::Completed);
    assert_eq!((last.total, last.completed, last.failed), (3, 3, 1));
    assert!(manager.progress().is_completed());
}

#[test]
fn test_concurrent_settlements_end_on_completed_snapshot() {
    for _ in 0..20 {
        let fetcher = Arc::new(ManualFetcher::default());
        let manager =
            ResourceFetchManager::new(fast_config(32), Arc::clone(&fetcher) as Arc<dyn ResourceFetcher<String>>)
                .unwrap();
        let keys: Vec<String> = (0..32).map(|i| format!("k{i}")).collect();
        manager.add(Arc::new(FetchGroup::new(keys, PassThrough)));
        wait_until("all fetches in flight", || fetcher.waiting() == 32);

        let batch = fetcher.take_waiting();
        let barrier = Arc::new(Barrier::new(batch.len()));
        let settlers: Vec<_> = batch
            .into_iter()
            .map(|(key, defer)| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    defer.resolve(key);
                })
            })
            .collect();
        for settler in settlers {
            settler.join().unwrap();
        }

        assert!(manager.progress().is_completed());
        assert_eq!(manager.progress().last_event().map(|e| e.kind), Some(ProgressKind::Completed));
        let late = manager.progress().on_complete_promise();
        assert!(late.join_timeout(Duration::from_secs(5)).unwrap());
        manager.stop();
    }
}

// ============================================================================
// FETCH GROUPS
// ============================================================================

#[test]
fn test_group_milestones_in_order() {
    let manager = ResourceFetchManager::new(fast_config(1), immediate()).unwrap();
    let milestones = Milestones::default();
    manager.add(Arc::new(FetchGroup::new(["x", "!y"], milestones.clone())));

    wait_until("group completion", || !milestones.completions.lock().is_empty());
    manager.stop();

    assert_eq!(
        *milestones.events.lock(),
        vec!["begin:x", "end:x:true", "begin:!y", "end:!y:false"]
    );
    assert_eq!(*milestones.completions.lock(), vec![(2, 1, 0)]);
}

#[test]
fn test_content_handler_transforms_results() {
    let manager = ResourceFetchManager::new(fast_config(2), immediate()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = ContentHandler::new(move |key: &str, content: String, defer: &Defer<String>| {
        let processed = format!("{key}={content}");
        sink.lock().push(processed.clone());
        defer.resolve(processed);
        Ok(())
    });
    let done = manager.progress().on_complete_promise();
    manager.add(Arc::new(FetchGroup::new(["p", "q"], handler)));
    assert!(done.join_timeout(Duration::from_secs(5)).unwrap());
    manager.stop();

    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, vec!["p=P", "q=Q"]);
}

#[test]
fn test_group_with_own_fetcher() {
    let manager = ResourceFetchManager::new(fast_config(2), immediate()).unwrap();
    let own_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&own_calls);
    let own: Arc<dyn ResourceFetcher<String>> = Arc::new(move |key: &str| {
        counter.fetch_add(1, Ordering::SeqCst);
        Promise::with_result(format!("own:{key}"))
    });
    let done = manager.progress().on_complete_promise();
    manager.add(Arc::new(FetchGroup::with_fetcher(own, ["1", "2", "3"], PassThrough)));
    assert!(done.join_timeout(Duration::from_secs(5)).unwrap());
    manager.stop();
    assert_eq!(own_calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_cancel_group_completes_with_fewer_fetches() {
    let fetcher = Arc::new(ManualFetcher::default());
    let manager = ResourceFetchManager::new(fast_config(1), Arc::clone(&fetcher) as Arc<dyn ResourceFetcher<String>>)
        .unwrap();
    let milestones = Milestones::default();
    let group = Arc::new(FetchGroup::new(["a", "b", "c", "d", "e"], milestones.clone()));
    let done = manager.progress().on_complete_promise();
    manager.add(Arc::clone(&group));

    wait_until("first fetch", || fetcher.waiting() == 1);
    assert_eq!(group.cancel(), 4);
    assert_eq!(group.remaining(), 0);
    fetcher.settle_all_shuffled();

    assert!(done.join_timeout(Duration::from_secs(5)).unwrap());
    let stats = manager.stats();
    assert_eq!((stats.total, stats.completed), (1, 1));
    assert_eq!(*milestones.completions.lock(), vec![(5, 0, 4)]);
    manager.stop();
}

#[test]
fn test_units_run_in_submission_order() {
    let manager = ResourceFetchManager::new(fast_config(1), immediate()).unwrap();
    let milestones = Milestones::default();
    manager.add(Arc::new(FetchGroup::single("first", milestones.clone())));
    manager.add(Arc::new(FetchGroup::new(["second", "third"], milestones.clone())));

    wait_until("both groups", || milestones.completions.lock().len() == 2);
    manager.stop();

    let begins: Vec<String> = milestones
        .events
        .lock()
        .iter()
        .filter(|event| event.starts_with("begin:"))
        .cloned()
        .collect();
    assert_eq!(begins, vec!["begin:first", "begin:second", "begin:third"]);
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn test_stopped_manager_keeps_units_until_restart() {
    let manager = ResourceFetchManager::new(fast_config(2), immediate()).unwrap();
    manager.stop();
    assert!(!manager.is_running());

    let done = manager.progress().on_complete_promise();
    manager.add(Arc::new(FetchGroup::new(["later"], PassThrough)));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(manager.stats().queued, 1);
    assert!(!done.is_settled());

    manager.start().unwrap();
    assert!(done.join_timeout(Duration::from_secs(5)).unwrap());
    manager.stop();
}

#[test]
fn test_restarted_driver_keeps_issued_count_of_resumed_unit() {
    let manager = ResourceFetchManager::new(fast_config(2), immediate()).unwrap();
    let unit = Arc::new(PanicsOnThird::default());
    manager.add(Arc::clone(&unit));
    wait_until("two fetches issued", || unit.issued.lock().len() == 2);

    manager.stop();
    manager.start().unwrap();
    let done = manager.progress().on_complete_promise();
    let issued: Vec<_> = unit.issued.lock().drain(..).collect();
    for defer in issued {
        defer.resolve("ok".to_string());
    }

    assert!(done.join_timeout(Duration::from_secs(5)).unwrap());
    let stats = manager.stats();
    assert_eq!((stats.total, stats.completed, stats.failed), (2, 2, 0));
    assert!(manager.progress().is_completed());
    manager.stop();
}

#[test]
fn test_close_if_empty_keeps_busy_manager_running() {
    let fetcher = Arc::new(ManualFetcher::default());
    let manager = ResourceFetchManager::new(fast_config(1), Arc::clone(&fetcher) as Arc<dyn ResourceFetcher<String>>)
        .unwrap();
    manager.add(Arc::new(FetchGroup::single("busy", PassThrough)));
    wait_until("fetch in flight", || fetcher.waiting() == 1);

    manager.close_if_empty();
    assert!(manager.is_running());
    fetcher.settle_all_shuffled();
    manager.stop();
}
