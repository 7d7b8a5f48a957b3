//! Bounded-concurrency coordinator for fetch units.
//!
//! A single driver thread pulls [`Fetch`] units from a channel and asks the
//! current unit for its next promise while fewer than `max_concurrent`
//! promises are outstanding. `pending` is raised before `next` is called, so
//! the bound holds even while a unit is producing its promise. Settlements
//! release capacity through a condvar and republish aggregate progress.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use tracing::{debug, info, warn};

use crate::config::FetchManagerConfig;
use crate::core::error::KernelError;
use crate::core::fetch::{Fetch, ResourceFetcher};
use crate::core::progress::{ProgressEvent, ProgressEventSource};

/// Aggregate counters of a [`ResourceFetchManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchManagerStats {
    /// Resources expected across every added unit.
    pub total: usize,
    /// Fetches that settled.
    pub completed: usize,
    /// Settled fetches that failed.
    pub failed: usize,
    /// Fetches currently outstanding.
    pub pending: usize,
    /// Units waiting in the queue.
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    pending: AtomicUsize,
}

/// Wake flags paired with the capacity condvar.
#[derive(Debug, Default)]
struct WakeState {
    capacity_available: bool,
    shutdown: bool,
}

type FetchUnit<T> = Arc<dyn Fetch<T>>;

struct Shared<T> {
    config: FetchManagerConfig,
    default_fetcher: Arc<dyn ResourceFetcher<T>>,
    counters: Counters,
    progress: ProgressEventSource,
    wake_state: Mutex<WakeState>,
    wake_condvar: Condvar,
    shutdown: AtomicBool,
    /// Orders snapshots so `last_event` never moves backwards. Reentrant
    /// because observers may call back into the manager.
    publish_lock: ReentrantMutex<()>,
    tx: Sender<FetchUnit<T>>,
    rx: Receiver<FetchUnit<T>>,
    /// Unit the driver was working on when it stopped, with its issued count.
    current: Mutex<Option<(FetchUnit<T>, usize)>>,
}

impl<T> Shared<T> {
    fn publish(&self) {
        let _ordered = self.publish_lock.lock();
        self.progress.notify(ProgressEvent::progress(
            self.counters.total.load(Ordering::Acquire),
            self.counters.completed.load(Ordering::Acquire),
            self.counters.failed.load(Ordering::Acquire),
            self.counters.pending.load(Ordering::Acquire),
        ));
    }

    fn release_capacity(&self) {
        self.wake_state.lock().capacity_available = true;
        self.wake_condvar.notify_one();
    }

    /// Block until a settlement frees capacity, shutdown, or `idle_wait` passes.
    fn wait_for_capacity(&self) {
        let mut state = self.wake_state.lock();
        while !state.capacity_available
            && !state.shutdown
            && self.counters.pending.load(Ordering::Acquire) >= self.config.max_concurrent
        {
            if self
                .wake_condvar
                .wait_for(&mut state, self.config.idle_wait())
                .timed_out()
            {
                break;
            }
        }
        state.capacity_available = false;
    }

    fn discard(&self, unit: &FetchUnit<T>, unissued: usize) {
        let dropped = unit.canceled() + unissued;
        if dropped > 0 {
            self.counters.total.fetch_sub(dropped, Ordering::AcqRel);
        }
        debug!(dropped, "fetch unit exhausted");
        self.publish();
    }
}

/// Runs fetch units with at most `max_concurrent` fetches outstanding.
pub struct ResourceFetchManager<T> {
    shared: Arc<Shared<T>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + 'static> ResourceFetchManager<T> {
    /// Create a manager and start its driver thread.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidConfig`] for an invalid configuration and
    /// [`KernelError::Spawn`] if the driver cannot be started.
    pub fn new(config: FetchManagerConfig, default_fetcher: Arc<dyn ResourceFetcher<T>>) -> Result<Self, KernelError> {
        config.validate().map_err(KernelError::InvalidConfig)?;
        let (tx, rx) = unbounded();
        let manager = Self {
            shared: Arc::new(Shared {
                config,
                default_fetcher,
                counters: Counters::default(),
                progress: ProgressEventSource::new(),
                wake_state: Mutex::new(WakeState::default()),
                wake_condvar: Condvar::new(),
                shutdown: AtomicBool::new(false),
                publish_lock: ReentrantMutex::new(()),
                tx,
                rx,
                current: Mutex::new(None),
            }),
            driver: Mutex::new(None),
        };
        manager.start()?;
        Ok(manager)
    }

    /// Start the driver if it is not running.
    ///
    /// # Errors
    ///
    /// [`KernelError::Spawn`] if the driver thread cannot be started.
    pub fn start(&self) -> Result<(), KernelError> {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return Ok(());
        }
        self.shared.shutdown.store(false, Ordering::Release);
        self.shared.wake_state.lock().shutdown = false;

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("fetch-driver".into())
            .spawn(move || drive(&shared))
            .map_err(KernelError::Spawn)?;
        *driver = Some(handle);
        info!(
            max_concurrent = self.shared.config.max_concurrent,
            "fetch manager started"
        );
        Ok(())
    }

    /// Stop the driver and wait for it to exit.
    ///
    /// Outstanding fetches keep settling and updating progress. Queued units
    /// stay queued for a later `start`.
    pub fn stop(&self) {
        self.signal_stop();
        let Some(handle) = self.driver.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Stopped from a continuation running on the driver itself.
            return;
        }
        if handle.join().is_err() {
            warn!("fetch driver panicked");
        }
        info!("fetch manager stopped");
    }

    fn signal_stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_state.lock().shutdown = true;
        self.shared.wake_condvar.notify_all();
    }

    /// Stop when nothing has ever been added (or everything added was dropped).
    pub fn close_if_empty(&self) {
        if self.shared.counters.total.load(Ordering::Acquire) == 0 {
            self.stop();
        }
    }

    /// True while the driver thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.driver.lock().is_some() && !self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Queue a fetch unit; its total is added to the aggregate immediately.
    pub fn add<F>(&self, fetch: Arc<F>)
    where
        F: Fetch<T> + 'static,
    {
        self.shared.counters.total.fetch_add(fetch.total(), Ordering::AcqRel);
        if self.shared.tx.send(fetch).is_err() {
            warn!("fetch queue disconnected");
        }
        self.shared.publish();
    }

    /// Aggregate progress events.
    #[must_use]
    pub fn progress(&self) -> &ProgressEventSource {
        &self.shared.progress
    }

    /// Snapshot of the aggregate counters.
    #[must_use]
    pub fn stats(&self) -> FetchManagerStats {
        let counters = &self.shared.counters;
        FetchManagerStats {
            total: counters.total.load(Ordering::Acquire),
            completed: counters.completed.load(Ordering::Acquire),
            failed: counters.failed.load(Ordering::Acquire),
            pending: counters.pending.load(Ordering::Acquire),
            queued: self.shared.rx.len(),
        }
    }
}

impl<T> Drop for ResourceFetchManager<T> {
    fn drop(&mut self) {
        // Signal only; the driver exits on its next wake.
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_state.lock().shutdown = true;
        self.shared.wake_condvar.notify_all();
    }
}

fn drive<T: Clone + Send + 'static>(shared: &Arc<Shared<T>>) {
    debug!("fetch driver started");
    let parked = shared.current.lock().take();
    let (mut current, mut issued) = parked.map_or((None, 0), |(unit, issued)| (Some(unit), issued));

    while !shared.shutdown.load(Ordering::Acquire) {
        let Some(unit) = current.clone() else {
            match shared.rx.recv_timeout(shared.config.idle_wait()) {
                Ok(unit) => {
                    current = Some(unit);
                    issued = 0;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            continue;
        };

        if shared.counters.pending.load(Ordering::Acquire) >= shared.config.max_concurrent {
            shared.wait_for_capacity();
            continue;
        }

        shared.counters.pending.fetch_add(1, Ordering::AcqRel);
        let next = panic::catch_unwind(AssertUnwindSafe(|| unit.next(&shared.default_fetcher)));
        match next {
            Ok(Some(promise)) => {
                issued += 1;
                shared.publish();
                let settled = Arc::clone(shared);
                promise.any(move |p| {
                    let counters = &settled.counters;
                    counters.completed.fetch_add(1, Ordering::AcqRel);
                    if !p.was_successful() {
                        counters.failed.fetch_add(1, Ordering::AcqRel);
                    }
                    counters.pending.fetch_sub(1, Ordering::AcqRel);
                    settled.publish();
                    settled.release_capacity();
                    Ok(())
                });
            }
            Ok(None) => {
                shared.counters.pending.fetch_sub(1, Ordering::AcqRel);
                shared.discard(&unit, 0);
                current = None;
            }
            Err(payload) => {
                shared.counters.pending.fetch_sub(1, Ordering::AcqRel);
                let err = KernelError::from_panic(payload.as_ref());
                warn!(error = %err, "fetch unit panicked; discarding it");
                let unissued = unit.total().saturating_sub(issued + unit.canceled());
                shared.discard(&unit, unissued);
                current = None;
            }
        }
    }

    *shared.current.lock() = current.map(|unit| (unit, issued));
    debug!("fetch driver exiting");
}
