//! Self-rescheduling timed task.
//!
//! A [`ContinuousTask`] runs its [`TaskWork`] after a delay, waits for the
//! directive promise the work returns, and re-arms itself accordingly. Each
//! `start` (and each `cancel`) bumps a generation counter; a timer thread
//! belonging to an older generation exits the next time it looks at the
//! shared state, so a canceled or restarted task never fires stale work.
//!
//! Delays are drift corrected: when a run fires late, the following delay is
//! shortened by the lateness (never below zero).

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::core::error::{Failure, KernelError};
use crate::core::promise::Promise;

/// What the task should do after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDirective {
    /// Do not run again until `start` is called.
    Stop,
    /// Run again after the configured interval.
    DefaultInterval,
    /// Run again immediately.
    NoDelay,
    /// Run again after the given delay.
    After(Duration),
}

/// One unit of periodic work.
pub trait TaskWork: Send + Sync + 'static {
    /// Perform the work. `elapsed` is the time since the run was scheduled.
    ///
    /// # Errors
    ///
    /// An error (like a rejected directive) reschedules after the interval.
    fn run(&self, elapsed: Duration) -> Result<Promise<TaskDirective>, Failure>;
}

impl<F> TaskWork for F
where
    F: Fn(Duration) -> Result<Promise<TaskDirective>, Failure> + Send + Sync + 'static,
{
    fn run(&self, elapsed: Duration) -> Result<Promise<TaskDirective>, Failure> {
        self(elapsed)
    }
}

/// Delay until the next run, shortened by how late the current run fired.
#[must_use]
pub fn drift_corrected_delay(interval: Duration, now: Instant, expected: Instant) -> Duration {
    let lateness = now.saturating_duration_since(expected);
    interval - lateness.min(interval)
}

struct TaskState {
    interval: Duration,
    last_requested: Instant,
    expected: Instant,
    generation: u64,
    armed: bool,
    active: bool,
    canceled: bool,
    directive: Option<Result<TaskDirective, Failure>>,
}

struct TaskInner {
    name: String,
    work: Box<dyn TaskWork>,
    state: Mutex<TaskState>,
    wake: Condvar,
}

/// Timer-driven task that reschedules itself from the directive its work returns.
///
/// Dropping the handle cancels the task.
pub struct ContinuousTask {
    inner: Arc<TaskInner>,
}

impl ContinuousTask {
    /// Create a stopped task with the given default interval.
    pub fn new<W>(name: impl Into<String>, interval: Duration, work: W) -> Self
    where
        W: TaskWork,
    {
        let now = Instant::now();
        Self {
            inner: Arc::new(TaskInner {
                name: name.into(),
                work: Box::new(work),
                state: Mutex::new(TaskState {
                    interval,
                    last_requested: now,
                    expected: now,
                    generation: 0,
                    armed: false,
                    active: false,
                    canceled: false,
                    directive: None,
                }),
                wake: Condvar::new(),
            }),
        }
    }

    /// Task name, also used for the timer thread.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Arm the task to run after `delay`, replacing any pending run.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Spawn`] if the timer thread cannot be started.
    pub fn start(&self, delay: Duration) -> Result<(), KernelError> {
        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.canceled = false;
            state.active = true;
            state.directive = None;
            arm(&mut state, delay);
            state.generation
        };
        self.inner.wake.notify_all();

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("task-{}", self.inner.name))
            .spawn(move || timer_loop(&inner, generation));
        if let Err(e) = spawned {
            let mut state = self.inner.state.lock();
            if state.generation == generation {
                state.active = false;
                state.armed = false;
            }
            return Err(KernelError::Spawn(e));
        }
        debug!(task = %self.inner.name, ?delay, generation, "continuous task armed");
        Ok(())
    }

    /// Stop the task. Pending timers never fire and in-flight work does not reschedule.
    pub fn cancel(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.active && state.canceled {
                return;
            }
            state.canceled = true;
            state.active = false;
            state.armed = false;
            state.generation += 1;
        }
        self.inner.wake.notify_all();
        debug!(task = %self.inner.name, "continuous task canceled");
    }

    /// Change the interval used by `DefaultInterval` and after failures.
    pub fn set_interval(&self, interval: Duration) {
        self.inner.state.lock().interval = interval;
    }

    /// The configured interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.state.lock().interval
    }

    /// True between `start` and `Stop`/`cancel`, including while work runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().active
    }

    /// True while a timer is waiting to fire.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.inner.state.lock().armed
    }
}

impl Drop for ContinuousTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn arm(state: &mut TaskState, delay: Duration) {
    let now = Instant::now();
    state.last_requested = now;
    state.expected = now + delay;
    state.armed = true;
}

fn timer_loop(inner: &Arc<TaskInner>, generation: u64) {
    loop {
        let elapsed = {
            let mut state = inner.state.lock();
            loop {
                if state.generation != generation {
                    return;
                }
                let deadline = state.expected;
                if Instant::now() >= deadline {
                    break;
                }
                inner.wake.wait_until(&mut state, deadline);
            }
            state.armed = false;
            state.directive = None;
            Instant::now().saturating_duration_since(state.last_requested)
        };

        let verdict = panic::catch_unwind(AssertUnwindSafe(|| inner.work.run(elapsed)))
            .unwrap_or_else(|payload| Err(KernelError::from_panic(payload.as_ref()).into()));
        match verdict {
            Ok(promise) => {
                let sink = Arc::clone(inner);
                promise.any(move |p| {
                    {
                        let mut state = sink.state.lock();
                        if state.generation == generation {
                            state.directive = Some(p.outcome().clone().into_result());
                        }
                    }
                    sink.wake.notify_all();
                    Ok(())
                });
            }
            Err(failure) => {
                inner.state.lock().directive = Some(Err(failure));
            }
        }

        let mut state = inner.state.lock();
        let directive = loop {
            if state.generation != generation {
                return;
            }
            if let Some(directive) = state.directive.take() {
                break directive;
            }
            inner.wake.wait(&mut state);
        };

        let delay = match directive {
            Ok(TaskDirective::Stop) => {
                state.active = false;
                debug!(task = %inner.name, "continuous task stopped");
                return;
            }
            Ok(TaskDirective::DefaultInterval) => state.interval,
            Ok(TaskDirective::NoDelay) => Duration::ZERO,
            Ok(TaskDirective::After(delay)) => delay,
            Err(failure) => {
                warn!(task = %inner.name, error = %failure, "continuous task run failed");
                state.interval
            }
        };
        let delay = drift_corrected_delay(delay, Instant::now(), state.expected);
        arm(&mut state, delay);
    }
}
