//! Retry-until-success fetching of a single key.
//!
//! A [`PersistentFetcher`] drives a [`ContinuousTask`] ticking at a short
//! interval. Ticks accumulate elapsed time and issue a fetch once the delay
//! chosen by the [`RetryStrategy`] has passed. The first success stops the
//! task and is reported to the listener.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::core::continuous_task::{ContinuousTask, TaskDirective};
use crate::core::error::{Failure, KernelError};
use crate::core::fetch::ResourceFetcher;
use crate::core::promise::{Outcome, Promise};

/// Default polling tick.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Chooses the delay before each retry.
pub trait RetryStrategy: Send + 'static {
    /// Restart the sequence of delays.
    fn reset(&mut self);

    /// Delay before the attempt after the current one, or `None` to make the
    /// current attempt the last.
    fn next_retry(&mut self) -> Option<Duration>;
}

/// Doubling delays from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl ExponentialBackoff {
    /// Backoff starting at `min` and capped at `max`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, next: min }
    }

    /// Backoff with the bounds from `config`.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.min_retry(), config.max_retry())
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn reset(&mut self) {
        self.next = self.min;
    }

    fn next_retry(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current.saturating_mul(2).min(self.max);
        Some(current)
    }
}

type Listener<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;

struct RetryState {
    since_last: Duration,
    next_request: Duration,
    exhausted: bool,
    strategy: Box<dyn RetryStrategy>,
}

struct Shared<T> {
    fetcher: Arc<dyn ResourceFetcher<T>>,
    key: String,
    listener: RwLock<Option<Listener<T>>>,
    state: Mutex<RetryState>,
    attempts: AtomicU64,
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn tick(&self, elapsed: Duration) -> Promise<TaskDirective> {
        let last_attempt = {
            let mut state = self.state.lock();
            state.since_last += elapsed;
            if state.since_last < state.next_request {
                return Promise::with_result(TaskDirective::DefaultInterval);
            }
            state.since_last = Duration::ZERO;
            match state.strategy.next_retry() {
                Some(delay) => state.next_request = delay,
                None => state.exhausted = true,
            }
            state.exhausted
        };

        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(key = %self.key, attempt, "persistent fetch attempt");

        let listener = self.listener.read().clone();
        let key = self.key.clone();
        self.fetcher
            .fetch(&self.key)
            .on_success(move |resource| {
                if let Some(listener) = listener {
                    listener(&key, resource);
                }
            })
            .filter(move |defer, outcome| {
                let directive = match outcome {
                    Outcome::Succeeded(_) => TaskDirective::Stop,
                    Outcome::Failed(failure) if last_attempt => {
                        warn!(attempt, error = %failure, "persistent fetch giving up");
                        TaskDirective::Stop
                    }
                    Outcome::Failed(failure) => {
                        debug!(attempt, error = %failure, "persistent fetch failed");
                        TaskDirective::DefaultInterval
                    }
                };
                defer.resolve(directive);
            })
    }
}

/// Fetches one key until it succeeds or is canceled.
pub struct PersistentFetcher<T> {
    shared: Arc<Shared<T>>,
    task: ContinuousTask,
}

impl<T: Clone + Send + 'static> PersistentFetcher<T> {
    /// Fetcher with the default exponential backoff and tick.
    pub fn new(fetcher: Arc<dyn ResourceFetcher<T>>, key: impl Into<String>) -> Self {
        Self::with_strategy(fetcher, key, ExponentialBackoff::default())
    }

    /// Fetcher with a custom retry strategy.
    pub fn with_strategy<S>(fetcher: Arc<dyn ResourceFetcher<T>>, key: impl Into<String>, strategy: S) -> Self
    where
        S: RetryStrategy,
    {
        Self::build(fetcher, key.into(), Box::new(strategy), DEFAULT_TICK)
    }

    /// Fetcher with backoff bounds and tick taken from `config`.
    pub fn with_config(fetcher: Arc<dyn ResourceFetcher<T>>, key: impl Into<String>, config: &RetryConfig) -> Self {
        Self::build(
            fetcher,
            key.into(),
            Box::new(ExponentialBackoff::from_config(config)),
            config.tick(),
        )
    }

    fn build(
        fetcher: Arc<dyn ResourceFetcher<T>>,
        key: String,
        strategy: Box<dyn RetryStrategy>,
        tick: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            fetcher,
            key,
            listener: RwLock::new(None),
            state: Mutex::new(RetryState {
                since_last: Duration::ZERO,
                next_request: Duration::ZERO,
                exhausted: false,
                strategy,
            }),
            attempts: AtomicU64::new(0),
        });
        let work = Arc::clone(&shared);
        let task = ContinuousTask::new(
            format!("fetch-{}", shared.key),
            tick,
            move |elapsed: Duration| -> Result<Promise<TaskDirective>, Failure> { Ok(work.tick(elapsed)) },
        );
        Self { shared, task }
    }

    /// The key being fetched.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Call `listener` with the key and resource when a fetch succeeds.
    pub fn set_listener<F>(&self, listener: F) -> &Self
    where
        F: Fn(&str, &T) + Send + Sync + 'static,
    {
        *self.shared.listener.write() = Some(Arc::new(listener));
        self
    }

    /// Reset the retry sequence and fetch immediately.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Spawn`] if the timer thread cannot be started.
    pub fn start(&self) -> Result<&Self, KernelError> {
        {
            let mut state = self.shared.state.lock();
            state.since_last = Duration::ZERO;
            state.next_request = Duration::ZERO;
            state.exhausted = false;
            state.strategy.reset();
        }
        self.task.start(Duration::ZERO)?;
        Ok(self)
    }

    /// Stop retrying. A fetch already in flight is not rescheduled.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// True until a fetch succeeds, retries run out, or `cancel` is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Fetch attempts issued so far.
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::Acquire)
    }
}
