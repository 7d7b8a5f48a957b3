//! Multi-observer notification channel with last-value replay.
//!
//! Observers are stored in an `Arc<Vec<_>>` that is copied and swapped on
//! every subscribe/unsubscribe. `notify` iterates a snapshot, so an observer
//! may unsubscribe itself (or anyone else) while being notified.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::core::promise::{Defer, Promise};

/// Identifies one subscription on an [`EventSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiver of events published by an [`EventSource`].
pub trait Observer<T>: Send + Sync {
    /// Called synchronously on the notifying thread.
    fn on_event(&self, source: &EventSource<T>, event: &T);
}

impl<T, F> Observer<T> for F
where
    F: Fn(&EventSource<T>, &T) + Send + Sync,
{
    fn on_event(&self, source: &EventSource<T>, event: &T) {
        self(source, event);
    }
}

type ObserverList<T> = Arc<Vec<(SubscriptionId, Arc<dyn Observer<T>>)>>;

struct SourceInner<T> {
    observers: RwLock<ObserverList<T>>,
    last_event: Mutex<Option<T>>,
    next_id: AtomicU64,
}

/// Publish/subscribe channel remembering the most recent event.
///
/// Cloning yields another handle to the same channel.
pub struct EventSource<T> {
    inner: Arc<SourceInner<T>>,
}

impl<T> Clone for EventSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for EventSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> EventSource<T> {
    /// Create a source with no observers and no last event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SourceInner {
                observers: RwLock::new(Arc::new(Vec::new())),
                last_event: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// The most recently notified event.
    #[must_use]
    pub fn last_event(&self) -> Option<T> {
        self.inner.last_event.lock().clone()
    }

    /// Number of current subscriptions.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.observers.read().len()
    }

    /// Store `event` and deliver it to every observer in subscription order.
    pub fn notify(&self, event: T) {
        *self.inner.last_event.lock() = Some(event.clone());
        let snapshot = Arc::clone(&*self.inner.observers.read());
        trace!(observers = snapshot.len(), "notifying observers");
        for (_, observer) in snapshot.iter() {
            observer.on_event(self, &event);
        }
    }

    /// Subscribe and replay the last event, if any.
    pub fn subscribe<O>(&self, observer: O) -> SubscriptionId
    where
        O: Observer<T> + 'static,
    {
        self.subscribe_with(observer, true)
    }

    /// Subscribe, optionally replaying the last event before returning.
    pub fn subscribe_with<O>(&self, observer: O, replay_last: bool) -> SubscriptionId
    where
        O: Observer<T> + 'static,
    {
        let id = self.allocate_id();
        self.insert(id, Arc::new(observer), replay_last);
        id
    }

    fn insert(&self, id: SubscriptionId, observer: Arc<dyn Observer<T>>, replay_last: bool) {
        if replay_last {
            if let Some(event) = self.last_event() {
                observer.on_event(self, &event);
            }
        }
        let mut observers = self.inner.observers.write();
        let mut updated = Vec::with_capacity(observers.len() + 1);
        updated.extend(observers.iter().cloned());
        updated.push((id, observer));
        *observers = Arc::new(updated);
    }

    /// Remove a subscription. Safe to call from inside an observer.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        unsubscribe_from(&self.inner, id)
    }

    /// A new source receiving only the events that pass `predicate`.
    #[must_use]
    pub fn filter<P>(&self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let sink = Self::new();
        let forward = sink.clone();
        self.subscribe(move |_: &Self, event: &T| {
            if predicate(event) {
                forward.notify(event.clone());
            }
        });
        sink
    }

    /// Deliver the next notified event to `callback`, then detach.
    pub fn wait_for_next_event<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        let observer = move |source: &Self, event: &T| {
            if source.unsubscribe(id) {
                callback(event);
            }
        };
        self.insert(id, Arc::new(observer), false);
        id
    }

    /// Bridge the stream into a single promise.
    ///
    /// `mapper` sees each event (the last event is replayed first) together
    /// with a [`Completer`]. The first call to `Completer::complete` detaches
    /// the observer and resolves the returned promise.
    pub fn to_promise<U, M>(&self, mapper: M) -> Promise<U>
    where
        U: Clone + Send + 'static,
        M: Fn(&T, &Completer<T, U>) + Send + Sync + 'static,
    {
        let defer = Defer::new();
        let promise = defer.promise();
        let id = self.allocate_id();
        let completer = Completer {
            source: Arc::downgrade(&self.inner),
            id,
            defer,
        };
        let observer = move |_: &Self, event: &T| mapper(event, &completer);
        self.insert(id, Arc::new(observer), true);
        // Completed by the replayed event before the observer was inserted.
        if promise.is_settled() {
            self.unsubscribe(id);
        }
        promise
    }

    /// Resolve with the first mapped value `mapper` returns.
    pub fn to_promise_when<U, M>(&self, mapper: M) -> Promise<U>
    where
        U: Clone + Send + 'static,
        M: Fn(&T) -> Option<U> + Send + Sync + 'static,
    {
        self.to_promise(move |event, completer| {
            if let Some(value) = mapper(event) {
                completer.complete(value);
            }
        })
    }
}

fn unsubscribe_from<T>(inner: &SourceInner<T>, id: SubscriptionId) -> bool {
    let mut observers = inner.observers.write();
    if !observers.iter().any(|(existing, _)| *existing == id) {
        return false;
    }
    let updated: Vec<_> = observers
        .iter()
        .filter(|(existing, _)| *existing != id)
        .cloned()
        .collect();
    *observers = Arc::new(updated);
    true
}

/// Completion handle passed to [`EventSource::to_promise`] mappers.
///
/// May be kept and completed later from any thread.
pub struct Completer<T, U> {
    source: Weak<SourceInner<T>>,
    id: SubscriptionId,
    defer: Defer<U>,
}

impl<T, U: Clone + Send + 'static> Completer<T, U> {
    /// Detach the bridging observer and resolve the promise with `value`.
    ///
    /// Returns `false` if the promise had already been completed.
    pub fn complete(&self, value: U) -> bool {
        if let Some(inner) = self.source.upgrade() {
            unsubscribe_from(&inner, self.id);
        }
        self.defer.resolve(value)
    }
}
