//! Cancelable job queues, their worker drivers, and the named-queue registry.
//!
//! A [`JobQueue`] is a FIFO of submitted jobs, each exposed as a promise.
//! Consumers pull with [`JobQueue::next`]; a [`JobQueueDriver`] runs that
//! pull loop on a fixed set of named worker threads sized by a
//! [`JobQueuePolicy`]. Cancel and dequeue both remove a job under the queue
//! mutex, so a job is either canceled or executed, never both.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::JobQueuePolicy;
use crate::core::error::{Failure, KernelError};
use crate::core::promise::{Defer, Promise};

/// Work submitted to a [`JobQueue`].
pub trait Job<T>: Send + Sync + 'static {
    /// Called once when the job enters the queue.
    fn on_queued(&self) {}

    /// Called once if the job is removed before it runs.
    fn on_canceled(&self) {}

    /// Run the job.
    ///
    /// # Errors
    ///
    /// An error rejects this job's promise.
    fn execute(&self) -> Result<T, Failure>;
}

impl<T, F> Job<T> for F
where
    F: Fn() -> Result<T, Failure> + Send + Sync + 'static,
{
    fn execute(&self) -> Result<T, Failure> {
        self()
    }
}

/// Counters describing a queue's history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQueueStats {
    /// Jobs accepted by `submit`.
    pub submitted: u64,
    /// Jobs that ran, successfully or not.
    pub executed: u64,
    /// Jobs whose execution returned an error or panicked.
    pub failed: u64,
    /// Jobs removed before running.
    pub canceled: u64,
    /// Jobs currently waiting.
    pub pending: usize,
}

#[derive(Default)]
struct QueueCounters {
    submitted: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
}

struct QueuedJob<T> {
    job: Arc<dyn Job<T>>,
    identity: usize,
    defer: Defer<T>,
}

impl<T: Clone + Send + 'static> QueuedJob<T> {
    fn cancel(self, reason: KernelError) {
        self.job.on_canceled();
        self.defer.reject(reason);
    }
}

fn identity_of<J>(job: &Arc<J>) -> usize {
    Arc::as_ptr(job).cast::<()>() as usize
}

struct Pending<T> {
    jobs: VecDeque<QueuedJob<T>>,
    closed: bool,
}

/// FIFO of cancelable jobs with per-job promises.
pub struct JobQueue<T> {
    pending: Mutex<Pending<T>>,
    available: Condvar,
    counters: QueueCounters,
}

impl<T: Clone + Send + 'static> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> JobQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                jobs: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            counters: QueueCounters::default(),
        }
    }

    /// Enqueue `job` and return the promise of its result.
    ///
    /// A closed queue rejects the promise with [`KernelError::Shutdown`]
    /// without calling `on_queued`.
    pub fn submit<J>(&self, job: Arc<J>) -> Promise<T>
    where
        J: Job<T>,
    {
        let identity = identity_of(&job);
        let defer = Defer::new();
        let promise = defer.promise();
        if self.pending.lock().closed {
            defer.reject(KernelError::Shutdown);
            return promise;
        }

        job.on_queued();
        let queued = QueuedJob {
            job,
            identity,
            defer,
        };
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                drop(pending);
                queued.cancel(KernelError::Shutdown);
                return promise;
            }
            pending.jobs.push_back(queued);
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
        debug!("job queued");
        promise
    }

    /// Remove `job` if it is still waiting.
    ///
    /// Returns `false` when the job is unknown or already dequeued. On success
    /// `on_canceled` fires and the job's promise is rejected with
    /// [`KernelError::Canceled`].
    pub fn cancel<J>(&self, job: &Arc<J>) -> bool
    where
        J: Job<T>,
    {
        let identity = identity_of(job);
        let removed = {
            let mut pending = self.pending.lock();
            pending
                .jobs
                .iter()
                .position(|queued| queued.identity == identity)
                .and_then(|index| pending.jobs.remove(index))
        };
        let Some(queued) = removed else {
            return false;
        };
        queued.cancel(KernelError::Canceled);
        self.counters.canceled.fetch_add(1, Ordering::Relaxed);
        debug!("job canceled");
        true
    }

    /// Execute the oldest waiting job on the calling thread.
    ///
    /// Returns `false` when the queue is empty.
    pub fn next(&self) -> bool {
        let queued = self.pending.lock().jobs.pop_front();
        queued.map_or(false, |queued| {
            self.run(queued);
            true
        })
    }

    /// Like [`JobQueue::next`], waiting up to `timeout` for a job to arrive.
    pub fn next_timeout(&self, timeout: Duration) -> bool {
        match self.take(Some(Instant::now() + timeout)) {
            Some(queued) => {
                self.run(queued);
                true
            }
            None => false,
        }
    }

    fn take(&self, deadline: Option<Instant>) -> Option<QueuedJob<T>> {
        let mut pending = self.pending.lock();
        loop {
            if let Some(queued) = pending.jobs.pop_front() {
                return Some(queued);
            }
            if pending.closed {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut pending, deadline).timed_out() {
                        return pending.jobs.pop_front();
                    }
                }
                None => self.available.wait(&mut pending),
            }
        }
    }

    fn run(&self, queued: QueuedJob<T>) {
        let QueuedJob { job, defer, .. } = queued;
        let result = panic::catch_unwind(AssertUnwindSafe(|| job.execute()))
            .unwrap_or_else(|payload| {
                let err = KernelError::from_panic(payload.as_ref());
                warn!(error = %err, "job panicked");
                Err(err.into())
            });
        self.counters.executed.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(value) => {
                defer.resolve(value);
            }
            Err(failure) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %failure, "job failed");
                defer.reject(failure);
            }
        }
    }

    /// Refuse new jobs and cancel every waiting one with [`KernelError::Shutdown`].
    ///
    /// Threads blocked waiting for work are released.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            pending.jobs.drain(..).collect()
        };
        self.available.notify_all();
        let count = drained.len() as u64;
        for queued in drained {
            queued.cancel(KernelError::Shutdown);
        }
        self.counters.canceled.fetch_add(count, Ordering::Relaxed);
    }

    /// True once `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Jobs waiting to run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().jobs.len()
    }

    /// True when no job is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the queue counters.
    #[must_use]
    pub fn stats(&self) -> JobQueueStats {
        JobQueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            canceled: self.counters.canceled.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }
}

/// Worker threads draining one [`JobQueue`].
pub struct JobQueueDriver<T> {
    name: String,
    queue: Arc<JobQueue<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl<T: Clone + Send + 'static> JobQueueDriver<T> {
    /// Spawn `policy.max_concurrent_jobs` workers pulling from `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidConfig`] for an invalid policy and
    /// [`KernelError::Spawn`] if a worker cannot be started.
    pub fn start(name: impl Into<String>, queue: Arc<JobQueue<T>>, policy: &JobQueuePolicy) -> Result<Self, KernelError> {
        policy.validate().map_err(KernelError::InvalidConfig)?;
        let name = name.into();
        let driver = Self {
            name,
            queue,
            workers: Mutex::new(Vec::with_capacity(policy.max_concurrent_jobs)),
            shutdown: AtomicBool::new(false),
        };

        for worker_id in 0..policy.max_concurrent_jobs {
            let queue = Arc::clone(&driver.queue);
            let queue_name = driver.name.clone();
            let spawned = thread::Builder::new()
                .name(format!("jq-{}-{worker_id}", driver.name))
                .stack_size(policy.thread_stack_size)
                .spawn(move || {
                    debug!(queue = %queue_name, worker_id, "job worker started");
                    while let Some(queued) = queue.take(None) {
                        queue.run(queued);
                    }
                    debug!(queue = %queue_name, worker_id, "job worker exiting");
                });
            match spawned {
                Ok(handle) => driver.workers.lock().push(handle),
                Err(e) => {
                    driver.shutdown();
                    return Err(KernelError::Spawn(e));
                }
            }
        }

        info!(
            queue = %driver.name,
            workers = policy.max_concurrent_jobs,
            "job queue driver started"
        );
        Ok(driver)
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The driven queue.
    #[must_use]
    pub const fn queue(&self) -> &Arc<JobQueue<T>> {
        &self.queue
    }

    /// Close the queue and join the workers.
    ///
    /// Jobs still waiting are canceled; a job already running finishes first.
    /// Workers that do not exit within two seconds are detached.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.close();

        let mut workers = self.workers.lock();
        let worker_count = workers.len();
        for (worker_id, worker) in workers.drain(..).enumerate() {
            let (tx, rx) = crossbeam_channel::bounded(1);
            let joiner = thread::spawn(move || {
                let _ = tx.send(worker.join().is_ok());
            });
            match rx.recv_timeout(Duration::from_secs(2)) {
                Ok(true) => debug!(queue = %self.name, worker_id, "job worker joined"),
                Ok(false) => warn!(queue = %self.name, worker_id, "job worker panicked"),
                Err(_) => {
                    warn!(queue = %self.name, worker_id, "job worker did not exit within timeout - detaching");
                    continue;
                }
            }
            let _ = joiner.join();
        }
        info!(queue = %self.name, worker_count, "job queue driver shut down");
    }
}

impl<T> Drop for JobQueueDriver<T> {
    fn drop(&mut self) {
        // Signal only; joining here could block on a long-running job.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            let mut pending = self.queue.pending.lock();
            pending.closed = true;
            drop(pending);
            self.queue.available.notify_all();
            debug!(queue = %self.name, "job queue driver dropped without explicit shutdown - workers will be detached");
        }
    }
}

/// Named job queues, each with its own driver.
pub struct JobQueueRegistry<T> {
    drivers: RwLock<HashMap<String, Arc<JobQueueDriver<T>>>>,
}

impl<T: Clone + Send + 'static> Default for JobQueueRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> JobQueueRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// Create a queue named `name` driven according to `policy`.
    ///
    /// # Errors
    ///
    /// [`KernelError::DuplicateQueue`] if the name is taken, otherwise any
    /// error from [`JobQueueDriver::start`].
    pub fn register(&self, name: &str, policy: &JobQueuePolicy) -> Result<Arc<JobQueue<T>>, KernelError> {
        let mut drivers = self.drivers.write();
        if drivers.contains_key(name) {
            return Err(KernelError::DuplicateQueue(name.to_string()));
        }
        let queue = Arc::new(JobQueue::new());
        let driver = JobQueueDriver::start(name, Arc::clone(&queue), policy)?;
        drivers.insert(name.to_string(), Arc::new(driver));
        Ok(queue)
    }

    /// Look up a registered queue.
    ///
    /// # Errors
    ///
    /// [`KernelError::QueueNotFound`] if no queue has that name.
    pub fn queue(&self, name: &str) -> Result<Arc<JobQueue<T>>, KernelError> {
        self.drivers
            .read()
            .get(name)
            .map(|driver| Arc::clone(driver.queue()))
            .ok_or_else(|| KernelError::QueueNotFound(name.to_string()))
    }

    /// Submit `job` to the queue named `name`.
    ///
    /// # Errors
    ///
    /// [`KernelError::QueueNotFound`] if no queue has that name.
    pub fn submit<J>(&self, name: &str, job: Arc<J>) -> Result<Promise<T>, KernelError>
    where
        J: Job<T>,
    {
        Ok(self.queue(name)?.submit(job))
    }

    /// Shut down and forget the queue named `name`.
    ///
    /// # Errors
    ///
    /// [`KernelError::QueueNotFound`] if no queue has that name.
    pub fn remove(&self, name: &str) -> Result<(), KernelError> {
        let driver = self
            .drivers
            .write()
            .remove(name)
            .ok_or_else(|| KernelError::QueueNotFound(name.to_string()))?;
        driver.shutdown();
        Ok(())
    }

    /// Registered queue names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drivers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Shut down every queue and clear the registry.
    pub fn shutdown(&self) {
        let drivers: Vec<_> = self.drivers.write().drain().map(|(_, driver)| driver).collect();
        for driver in drivers {
            driver.shutdown();
        }
    }
}
