//! Fetch capabilities and fetch groups consumed by the fetch manager.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::error::Failure;
use crate::core::promise::{Defer, Promise};

/// Produces a promise for the resource named by `key`.
pub trait ResourceFetcher<T>: Send + Sync {
    /// Start fetching `key`.
    fn fetch(&self, key: &str) -> Promise<T>;
}

impl<T, F> ResourceFetcher<T> for F
where
    F: Fn(&str) -> Promise<T> + Send + Sync,
{
    fn fetch(&self, key: &str) -> Promise<T> {
        self(key)
    }
}

/// A unit of fetch work handed to a `ResourceFetchManager`.
pub trait Fetch<T>: Send + Sync {
    /// Number of resources this unit will fetch.
    fn total(&self) -> usize;

    /// Issue the next fetch, or `None` once the unit is exhausted.
    fn next(&self, default_fetcher: &Arc<dyn ResourceFetcher<T>>) -> Option<Promise<T>>;

    /// Resources that were dropped without being fetched.
    fn canceled(&self) -> usize {
        0
    }
}

/// Milestone callbacks of a [`FetchGroup`].
///
/// Every method has a default, so a handler only overrides what it needs.
pub trait FetchHandler<T>: Send + Sync {
    /// A fetch for `key` is about to be issued.
    fn on_begin_fetch(&self, _key: &str) {}

    /// Content for `key` arrived; settle `sink` with the processed value.
    ///
    /// # Errors
    ///
    /// An error rejects the fetch.
    fn on_content(&self, _key: &str, content: T, sink: &Defer<T>) -> Result<(), Failure>
    where
        T: Clone + Send + 'static,
    {
        sink.resolve(content);
        Ok(())
    }

    /// The fetch for `key` finished.
    fn on_end_fetch(&self, _key: &str, _success: bool) {}

    /// Every key was either fetched or canceled.
    fn on_complete(&self, _total: usize, _failed: usize, _canceled: usize) {}
}

/// [`FetchHandler`] implemented by a single content closure.
pub struct ContentHandler<T, F> {
    on_content: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F> ContentHandler<T, F>
where
    F: Fn(&str, T, &Defer<T>) -> Result<(), Failure> + Send + Sync,
{
    /// Wrap `on_content`.
    pub const fn new(on_content: F) -> Self {
        Self {
            on_content,
            _marker: PhantomData,
        }
    }
}

impl<T, F> FetchHandler<T> for ContentHandler<T, F>
where
    F: Fn(&str, T, &Defer<T>) -> Result<(), Failure> + Send + Sync,
{
    fn on_content(&self, key: &str, content: T, sink: &Defer<T>) -> Result<(), Failure>
    where
        T: Clone + Send + 'static,
    {
        (self.on_content)(key, content, sink)
    }
}

/// Handler with no callbacks; fetched content passes through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl<T> FetchHandler<T> for PassThrough {}

#[derive(Default)]
struct GroupCounters {
    failed: AtomicUsize,
    canceled: AtomicUsize,
    settled: AtomicUsize,
    empty_reported: AtomicBool,
}

/// An ordered batch of keys fetched one `next` at a time.
pub struct FetchGroup<T> {
    keys: Mutex<VecDeque<String>>,
    total: usize,
    fetcher: Option<Arc<dyn ResourceFetcher<T>>>,
    handler: Arc<dyn FetchHandler<T>>,
    counters: Arc<GroupCounters>,
}

impl<T: Clone + Send + 'static> FetchGroup<T> {
    /// Group over `keys` using the manager's default fetcher.
    pub fn new<I, K, H>(keys: I, handler: H) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
        H: FetchHandler<T> + 'static,
    {
        Self::build(None, keys, Arc::new(handler))
    }

    /// Group of one key.
    pub fn single<H>(key: impl Into<String>, handler: H) -> Self
    where
        H: FetchHandler<T> + 'static,
    {
        Self::new([key.into()], handler)
    }

    /// Group over `keys` fetched by `fetcher` instead of the default.
    pub fn with_fetcher<I, K, H>(fetcher: Arc<dyn ResourceFetcher<T>>, keys: I, handler: H) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
        H: FetchHandler<T> + 'static,
    {
        Self::build(Some(fetcher), keys, Arc::new(handler))
    }

    fn build<I, K>(
        fetcher: Option<Arc<dyn ResourceFetcher<T>>>,
        keys: I,
        handler: Arc<dyn FetchHandler<T>>,
    ) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: VecDeque<String> = keys.into_iter().map(Into::into).collect();
        Self {
            total: keys.len(),
            keys: Mutex::new(keys),
            fetcher,
            handler,
            counters: Arc::new(GroupCounters::default()),
        }
    }

    /// Keys not yet issued.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.keys.lock().len()
    }

    /// Drop every key not yet issued and return how many were dropped.
    ///
    /// Fetches already in flight still complete normally.
    pub fn cancel(&self) -> usize {
        let dropped = {
            let mut keys = self.keys.lock();
            let dropped = keys.len();
            keys.clear();
            dropped
        };
        if dropped > 0 {
            self.counters.canceled.fetch_add(dropped, Ordering::AcqRel);
            debug!(dropped, "fetch group canceled");
            settle_keys(&self.counters, &*self.handler, self.total, dropped);
        }
        dropped
    }
}

impl<T: Clone + Send + 'static> Fetch<T> for FetchGroup<T> {
    fn total(&self) -> usize {
        self.total
    }

    fn canceled(&self) -> usize {
        self.counters.canceled.load(Ordering::Acquire)
    }

    fn next(&self, default_fetcher: &Arc<dyn ResourceFetcher<T>>) -> Option<Promise<T>> {
        let Some(key) = self.keys.lock().pop_front() else {
            if self.total == 0 && !self.counters.empty_reported.swap(true, Ordering::AcqRel) {
                self.handler.on_complete(0, 0, 0);
            }
            return None;
        };

        self.handler.on_begin_fetch(&key);
        let fetcher = self.fetcher.as_ref().unwrap_or(default_fetcher);
        let fetched = fetcher.fetch(&key);

        let handler = Arc::clone(&self.handler);
        let content_key = key.clone();
        let processed = fetched.defer_with(move |sink, p| {
            match p.outcome().clone().into_result() {
                Ok(content) => handler.on_content(&content_key, content, sink)?,
                Err(failure) => {
                    sink.reject(failure);
                }
            }
            Ok(())
        });

        let handler = Arc::clone(&self.handler);
        let counters = Arc::clone(&self.counters);
        let total = self.total;
        Some(processed.any(move |p| {
            let success = p.was_successful();
            if !success {
                counters.failed.fetch_add(1, Ordering::AcqRel);
            }
            handler.on_end_fetch(&key, success);
            settle_keys(&counters, &*handler, total, 1);
            Ok(())
        }))
    }
}

fn settle_keys<T>(counters: &GroupCounters, handler: &dyn FetchHandler<T>, total: usize, count: usize) {
    let before = counters.settled.fetch_add(count, Ordering::AcqRel);
    if before < total && before + count >= total {
        handler.on_complete(
            total,
            counters.failed.load(Ordering::Acquire),
            counters.canceled.load(Ordering::Acquire),
        );
    }
}
