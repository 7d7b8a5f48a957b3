//! Single-assignment promise cells with chainable continuations.
//!
//! A [`Defer`] is the producer side and a [`Promise`] the consumer side of one
//! cell. The cell moves from `Pending` to `Settled` exactly once; the claim is
//! an atomic swap, so racing producers cannot double-settle.
//!
//! # Chaining
//!
//! Every cell owns at most one continuation and one lazily-created `next`
//! cell. `then`/`fail`/`any` return that `next` cell, which represents the
//! continuation's own outcome. Attaching a second continuation to the same
//! promise appends it after the first one, so continuations on one promise run
//! strictly in attachment order and never concurrently with their predecessor.
//!
//! A continuation receives a [`Triggered`] context. Returning `Err` rejects
//! the derived promise; `succeed_with`/`fail_with` override the forwarded
//! outcome; `continue_after` holds propagation until another promise settles
//! and then forwards that promise's outcome instead.
//!
//! # Threading
//!
//! There is no executor. A continuation runs on whichever thread settles the
//! cell, or on the attaching thread when the cell was already settled. The
//! cell's mutex is never held while user code runs.
//!
//! ```rust,ignore
//! use deferred_kernel::core::{Defer, Promise};
//!
//! let defer = Defer::<u32>::new();
//! let doubled = defer.promise().then(|p| {
//!     let value = *p.result().unwrap_or(&0);
//!     p.succeed_with(value * 2);
//!     Ok(())
//! });
//! defer.resolve(21);
//! assert_eq!(doubled.join().unwrap(), 42);
//! ```

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::core::error::{Failure, KernelError};

/// Settled outcome of a promise.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The producer resolved with a value.
    Succeeded(T),
    /// The producer rejected with an error.
    Failed(Failure),
}

impl<T> Outcome<T> {
    /// True for `Succeeded`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// Borrow the success value, if any.
    #[must_use]
    pub const fn result(&self) -> Option<&T> {
        match self {
            Self::Succeeded(value) => Some(value),
            Self::Failed(_) => None,
        }
    }

    /// Borrow the failure, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&Failure> {
        match self {
            Self::Succeeded(_) => None,
            Self::Failed(failure) => Some(failure),
        }
    }

    /// Convert into a standard `Result`.
    ///
    /// # Errors
    ///
    /// Returns the failure of a `Failed` outcome.
    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Self::Succeeded(value) => Ok(value),
            Self::Failed(failure) => Err(failure),
        }
    }
}

impl<T> From<Result<T, Failure>> for Outcome<T> {
    fn from(result: Result<T, Failure>) -> Self {
        match result {
            Ok(value) => Self::Succeeded(value),
            Err(failure) => Self::Failed(failure),
        }
    }
}

/// Cell state: the explicit pending/settled machine.
enum State<T> {
    Pending,
    Settled(Outcome<T>),
}

type Handler<T> = Box<dyn FnOnce(&mut Triggered<T>) -> Result<(), Failure> + Send>;

/// The handler(s) waiting on a cell, keyed by which outcome they accept.
enum Continuation<T> {
    Success(Handler<T>),
    Failure(Handler<T>),
    Either {
        on_success: Handler<T>,
        on_failure: Handler<T>,
    },
    Any(Handler<T>),
    /// Copy the outcome into another cell; installed by `continue_after`.
    Forward(Promise<T>),
}

impl<T> Continuation<T> {
    fn select(self, succeeded: bool) -> Option<Handler<T>> {
        match (self, succeeded) {
            (Self::Success(handler), true)
            | (Self::Failure(handler), false)
            | (Self::Any(handler), _) => Some(handler),
            (Self::Either { on_success, .. }, true) => Some(on_success),
            (Self::Either { on_failure, .. }, false) => Some(on_failure),
            _ => None,
        }
    }
}

struct Inner<T> {
    state: State<T>,
    continuation: Option<Continuation<T>>,
    next: Option<Promise<T>>,
    wakers: Vec<Waker>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Unlink the chain one cell at a time; nested drops overflow on long chains.
        let mut next = self.next.take();
        while let Some(promise) = next {
            next = Arc::try_unwrap(promise.cell)
                .ok()
                .and_then(|cell| cell.inner.into_inner().next.take());
        }
    }
}

/// Settlements waiting to be applied by [`drain`].
type Work<T> = Vec<(Promise<T>, Outcome<T>)>;

/// Result of storing an outcome in a cell.
enum Settle<T> {
    /// The cell was already claimed.
    Ignored,
    /// Stored; nothing was waiting.
    Stored,
    /// Stored; `continuation` now runs and settles `next`.
    Released {
        continuation: Continuation<T>,
        next: Promise<T>,
        outcome: Outcome<T>,
    },
}

struct Cell<T> {
    /// Set by the first settlement attempt; later attempts are rejected.
    claimed: AtomicBool,
    inner: Mutex<Inner<T>>,
    settled: Condvar,
}

/// Consumer handle of a single-assignment asynchronous result.
///
/// Cloning is cheap and every clone observes the same cell.
pub struct Promise<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.cell.inner.lock();
        match &inner.state {
            State::Pending => f.write_str("Promise(Pending)"),
            State::Settled(outcome) => write!(f, "Promise({outcome:?})"),
        }
    }
}

/// Producer handle: the exclusive right to settle a [`Promise`].
pub struct Defer<T> {
    promise: Promise<T>,
}

impl<T> Clone for Defer<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Defer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Defer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defer").field("promise", &self.promise).finish()
    }
}

impl<T: Clone + Send + 'static> Defer<T> {
    /// Create an unsettled producer/consumer pair.
    #[must_use]
    pub fn new() -> Self {
        Self {
            promise: Promise::new_cell(),
        }
    }

    /// The consumer side of this deferred.
    #[must_use]
    pub fn promise(&self) -> Promise<T> {
        self.promise.clone()
    }

    /// Settle with a value. Returns `false` if the promise was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.promise.settle(Outcome::Succeeded(value))
    }

    /// Settle with an error. Returns `false` if the promise was already settled.
    pub fn reject(&self, failure: impl Into<Failure>) -> bool {
        self.promise.settle(Outcome::Failed(failure.into()))
    }

    /// Settle with a prepared outcome. Returns `false` if already settled.
    pub fn settle(&self, outcome: Outcome<T>) -> bool {
        self.promise.settle(outcome)
    }

    /// True once any settlement attempt has claimed the promise.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.promise.cell.claimed.load(Ordering::Acquire)
    }
}

/// Context handed to a continuation while it runs.
pub struct Triggered<T> {
    outcome: Outcome<T>,
    forward: Option<Outcome<T>>,
    continue_after: Option<Promise<T>>,
}

impl<T: Clone + Send + 'static> Triggered<T> {
    const fn new(outcome: Outcome<T>) -> Self {
        Self {
            outcome,
            forward: None,
            continue_after: None,
        }
    }

    /// True when the triggering promise succeeded.
    #[must_use]
    pub const fn was_successful(&self) -> bool {
        self.outcome.is_success()
    }

    /// The triggering value, if the promise succeeded.
    #[must_use]
    pub const fn result(&self) -> Option<&T> {
        self.outcome.result()
    }

    /// The triggering error, if the promise failed.
    #[must_use]
    pub const fn error(&self) -> Option<&Failure> {
        self.outcome.error()
    }

    /// The triggering outcome.
    #[must_use]
    pub const fn outcome(&self) -> &Outcome<T> {
        &self.outcome
    }

    /// Forward `value` as a success instead of the triggering outcome.
    pub fn succeed_with(&mut self, value: T) {
        self.forward = Some(Outcome::Succeeded(value));
    }

    /// Forward `failure` instead of the triggering outcome.
    pub fn fail_with(&mut self, failure: impl Into<Failure>) {
        self.forward = Some(Outcome::Failed(failure.into()));
    }

    /// Hold the chain until `promise` settles, then forward its outcome.
    pub fn continue_after(&mut self, promise: Promise<T>) {
        self.continue_after = Some(promise);
    }

    /// Hold the chain until the returned deferred is settled.
    pub fn continue_after_defer(&mut self) -> Defer<T> {
        let defer = Defer::new();
        self.continue_after(defer.promise());
        defer
    }

    /// Copy the triggering outcome into `defer`.
    pub fn settle(&self, defer: &Defer<T>) -> bool {
        defer.settle(self.outcome.clone())
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    fn new_cell() -> Self {
        Self {
            cell: Arc::new(Cell {
                claimed: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    state: State::Pending,
                    continuation: None,
                    next: None,
                    wakers: Vec::new(),
                }),
                settled: Condvar::new(),
            }),
        }
    }

    /// Create an unsettled deferred.
    #[must_use]
    pub fn defer() -> Defer<T> {
        Defer::new()
    }

    /// An already-resolved promise.
    #[must_use]
    pub fn with_result(value: T) -> Self {
        let defer = Defer::new();
        defer.resolve(value);
        defer.promise
    }

    /// An already-rejected promise.
    #[must_use]
    pub fn with_error(failure: impl Into<Failure>) -> Self {
        let defer = Defer::new();
        defer.reject(failure);
        defer.promise
    }

    /// Resolve with `value` and immediately run `handler` on it.
    pub fn with_handler<F>(value: T, handler: F) -> Self
    where
        F: FnOnce(&mut Triggered<T>) -> Result<(), Failure> + Send + 'static,
    {
        Self::with_result(value).then(handler)
    }

    fn settle(&self, outcome: Outcome<T>) -> bool {
        let mut work = Work::new();
        match self.complete(outcome) {
            Settle::Ignored => {
                debug!("ignored settlement of an already settled promise");
                return false;
            }
            Settle::Stored => return true,
            Settle::Released {
                continuation,
                next,
                outcome,
            } => fire(continuation, outcome, next, &mut work),
        }
        drain(work);
        true
    }

    /// Claim the cell, store `outcome` and wake waiters.
    fn complete(&self, outcome: Outcome<T>) -> Settle<T> {
        if self.cell.claimed.swap(true, Ordering::AcqRel) {
            return Settle::Ignored;
        }

        let (released, wakers) = {
            let mut inner = self.cell.inner.lock();
            inner.state = State::Settled(outcome.clone());
            let wakers = std::mem::take(&mut inner.wakers);
            (inner.continuation.take().zip(inner.next.clone()), wakers)
        };
        self.cell.settled.notify_all();
        for waker in wakers {
            waker.wake();
        }

        match released {
            Some((continuation, next)) => Settle::Released {
                continuation,
                next,
                outcome,
            },
            None => Settle::Stored,
        }
    }

    fn attach(&self, continuation: Continuation<T>) -> Self {
        let mut work = Work::new();
        let next = self.attach_with(continuation, &mut work);
        drain(work);
        next
    }

    /// Append `continuation` at the end of this cell's chain. When the tail is
    /// already settled the continuation runs now and its settlement lands in `work`.
    fn attach_with(&self, continuation: Continuation<T>, work: &mut Work<T>) -> Self {
        let mut target = self.clone();
        loop {
            let mut inner = target.cell.inner.lock();
            if let Some(next) = inner.next.clone() {
                drop(inner);
                target = next;
                continue;
            }

            let next = Self::new_cell();
            inner.next = Some(next.clone());
            let settled = match &inner.state {
                State::Pending => None,
                State::Settled(outcome) => Some(outcome.clone()),
            };
            if let Some(outcome) = settled {
                drop(inner);
                fire(continuation, outcome, next.clone(), work);
            } else {
                inner.continuation = Some(continuation);
            }
            return next;
        }
    }

    /// Run `handler` when this promise succeeds. Failures pass through.
    pub fn then<F>(&self, handler: F) -> Self
    where
        F: FnOnce(&mut Triggered<T>) -> Result<(), Failure> + Send + 'static,
    {
        self.attach(Continuation::Success(Box::new(handler)))
    }

    /// Run `handler` when this promise fails. Successes pass through.
    pub fn fail<F>(&self, handler: F) -> Self
    where
        F: FnOnce(&mut Triggered<T>) -> Result<(), Failure> + Send + 'static,
    {
        self.attach(Continuation::Failure(Box::new(handler)))
    }

    /// Run `handler` whichever way this promise settles.
    pub fn any<F>(&self, handler: F) -> Self
    where
        F: FnOnce(&mut Triggered<T>) -> Result<(), Failure> + Send + 'static,
    {
        self.attach(Continuation::Any(Box::new(handler)))
    }

    /// Run `on_success` or `on_failure` depending on the outcome.
    pub fn then_or<S, F>(&self, on_success: S, on_failure: F) -> Self
    where
        S: FnOnce(&mut Triggered<T>) -> Result<(), Failure> + Send + 'static,
        F: FnOnce(&mut Triggered<T>) -> Result<(), Failure> + Send + 'static,
    {
        self.attach(Continuation::Either {
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        })
    }

    /// Observe the success value without altering the chain.
    pub fn on_success<F>(&self, observer: F) -> Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.then(move |p| {
            if let Some(value) = p.result() {
                observer(value);
            }
            Ok(())
        })
    }

    /// Transfer the outcome into `defer` and continue once its promise settles.
    ///
    /// Continuations already attached to `defer`'s promise run before the
    /// chain returned here proceeds.
    pub fn then_defer(&self, defer: &Defer<T>) -> Self {
        let defer = defer.clone();
        self.any(move |p| {
            p.continue_after(defer.promise());
            p.settle(&defer);
            Ok(())
        })
    }

    /// Produce a promise settled by `block`; an error from `block` rejects it.
    pub fn defer_with<F>(&self, block: F) -> Self
    where
        F: FnOnce(&Defer<T>, &Triggered<T>) -> Result<(), Failure> + Send + 'static,
    {
        let defer = Defer::new();
        let sink = defer.clone();
        self.any(move |p| {
            if let Err(failure) = block(&sink, p) {
                sink.reject(failure);
            }
            Ok(())
        });
        defer.promise
    }

    /// Convert a success value into a differently typed promise.
    ///
    /// Failures are forwarded; an error returned by `convert` rejects the
    /// converted promise.
    pub fn convert<U, F>(&self, convert: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T, &Defer<U>) -> Result<(), Failure> + Send + 'static,
    {
        let defer = Defer::new();
        let sink = defer.clone();
        self.any(move |p| {
            match p.outcome().clone() {
                Outcome::Succeeded(value) => {
                    if let Err(failure) = convert(value, &sink) {
                        sink.reject(failure);
                    }
                }
                Outcome::Failed(failure) => {
                    sink.reject(failure);
                }
            }
            Ok(())
        });
        defer.promise
    }

    /// Translate any outcome into a differently typed promise.
    ///
    /// `filter` sees the full outcome and must settle the provided deferred.
    pub fn filter<U, F>(&self, filter: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(&Defer<U>, Outcome<T>) + Send + 'static,
    {
        let defer = Defer::new();
        let sink = defer.clone();
        self.any(move |p| {
            filter(&sink, p.outcome().clone());
            Ok(())
        });
        defer.promise
    }

    /// The success value rendered with `Display`.
    pub fn display(&self) -> Promise<String>
    where
        T: fmt::Display,
    {
        self.filter(|defer, outcome| match outcome {
            Outcome::Succeeded(value) => {
                defer.resolve(value.to_string());
            }
            Outcome::Failed(failure) => {
                defer.reject(failure);
            }
        })
    }

    /// Log a rejection at error level; the chain continues unchanged.
    pub fn log_failure(&self, context: &'static str) -> Self {
        self.fail(move |p| {
            if let Some(failure) = p.error() {
                error!(context, error = %failure, "promise rejected");
            }
            Ok(())
        })
    }

    /// Resolve with every value, in input order, once all inputs succeed.
    ///
    /// The first rejection observed rejects the combined promise; later
    /// rejections and successes are discarded. An empty input resolves to an
    /// empty vector.
    #[must_use]
    pub fn all(promises: Vec<Self>) -> Promise<Vec<T>> {
        let defer = Defer::new();
        let total = promises.len();
        if total == 0 {
            defer.resolve(Vec::new());
            return defer.promise;
        }

        let shared = Arc::new(AllState {
            results: Mutex::new(vec![None; total]),
            resolved: AtomicUsize::new(0),
            rejected: AtomicBool::new(false),
        });

        for (index, promise) in promises.into_iter().enumerate() {
            let success_state = Arc::clone(&shared);
            let success_defer = defer.clone();
            let failure_state = Arc::clone(&shared);
            let failure_defer = defer.clone();
            promise.then_or(
                move |p| {
                    if success_state.rejected.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    if let Some(value) = p.result() {
                        success_state.results.lock()[index] = Some(value.clone());
                    }
                    if success_state.resolved.fetch_add(1, Ordering::AcqRel) + 1 == total {
                        let values = success_state.results.lock().drain(..).flatten().collect();
                        success_defer.resolve(values);
                    }
                    Ok(())
                },
                move |p| {
                    if !failure_state.rejected.swap(true, Ordering::AcqRel) {
                        if let Some(failure) = p.error() {
                            failure_defer.reject(failure.clone());
                        }
                    }
                    Ok(())
                },
            );
        }
        defer.promise
    }

    /// Build one promise per item through `block`, then combine them with [`Promise::all`].
    pub fn from_list<U, I, F>(items: I, mut block: F) -> Promise<Vec<T>>
    where
        I: IntoIterator<Item = U>,
        F: FnMut(&Defer<T>, U) -> Result<(), Failure>,
    {
        let promises = items
            .into_iter()
            .map(|item| {
                let defer = Defer::new();
                if let Err(failure) = block(&defer, item) {
                    defer.reject(failure);
                }
                defer.promise
            })
            .collect();
        Self::all(promises)
    }

    /// Combine `count` promises produced by index.
    pub fn collect<F>(count: usize, block: F) -> Promise<Vec<T>>
    where
        F: FnMut(usize) -> Self,
    {
        Self::all((0..count).map(block).collect())
    }

    /// True once the promise has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self.cell.inner.lock().state, State::Settled(_))
    }

    /// True once the promise has settled successfully.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        matches!(
            self.cell.inner.lock().state,
            State::Settled(Outcome::Succeeded(_))
        )
    }

    /// The settled outcome, or `None` while pending.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &self.cell.inner.lock().state {
            State::Pending => None,
            State::Settled(outcome) => Some(outcome.clone()),
        }
    }

    /// The success value, if settled successfully.
    #[must_use]
    pub fn result(&self) -> Option<T> {
        self.outcome().and_then(|outcome| outcome.into_result().ok())
    }

    /// The failure, if rejected.
    #[must_use]
    pub fn error(&self) -> Option<Failure> {
        self.outcome().and_then(|outcome| outcome.into_result().err())
    }

    /// True when both handles refer to the same cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Block until this promise settles.
    ///
    /// Must not be called on the thread expected to settle the promise.
    ///
    /// # Errors
    ///
    /// Returns the rejection of the promise.
    pub fn join(&self) -> Result<T, Failure> {
        let mut inner = self.cell.inner.lock();
        loop {
            if let State::Settled(outcome) = &inner.state {
                return outcome.clone().into_result();
            }
            self.cell.settled.wait(&mut inner);
        }
    }

    /// Block until this promise settles or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns the rejection of the promise, or a [`KernelError::Timeout`]
    /// failure if the deadline passes first.
    pub fn join_timeout(&self, timeout: Duration) -> Result<T, Failure> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.cell.inner.lock();
        loop {
            if let State::Settled(outcome) = &inner.state {
                return outcome.clone().into_result();
            }
            if self.cell.settled.wait_until(&mut inner, deadline).timed_out() {
                if let State::Settled(outcome) = &inner.state {
                    return outcome.clone().into_result();
                }
                return Err(KernelError::Timeout.into());
            }
        }
    }
}

struct AllState<T> {
    results: Mutex<Vec<Option<T>>>,
    resolved: AtomicUsize,
    rejected: AtomicBool,
}

/// Apply queued settlements until the chain goes quiet.
fn drain<T: Clone + Send + 'static>(mut work: Work<T>) {
    while let Some((target, outcome)) = work.pop() {
        if let Settle::Released {
            continuation,
            next,
            outcome,
        } = target.complete(outcome)
        {
            fire(continuation, outcome, next, &mut work);
        }
    }
}

/// Run a continuation against a settled outcome and queue the settlement of `next`.
///
/// `work` is a stack, so a forwarded target's chain runs before the cells
/// attached after the forward.
fn fire<T: Clone + Send + 'static>(continuation: Continuation<T>, outcome: Outcome<T>, next: Promise<T>, work: &mut Work<T>) {
    if let Continuation::Forward(target) = continuation {
        work.push((next, outcome.clone()));
        work.push((target, outcome));
        return;
    }
    let Some(handler) = continuation.select(outcome.is_success()) else {
        work.push((next, outcome));
        return;
    };

    let mut triggered = Triggered::new(outcome);
    let verdict = handler(&mut triggered);
    let Triggered {
        outcome,
        forward,
        continue_after,
    } = triggered;

    match (verdict, continue_after) {
        (Err(failure), _) => work.push((next, Outcome::Failed(failure))),
        (Ok(()), Some(inner)) => {
            inner.attach_with(Continuation::Forward(next), work);
        }
        (Ok(()), None) => work.push((next, forward.unwrap_or(outcome))),
    }
}

/// Future adapter returned by `Promise::into_future`.
pub struct PromiseFuture<T> {
    promise: Promise<T>,
}

impl<T: Clone + Send + 'static> Future for PromiseFuture<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.promise.cell.inner.lock();
        if let State::Settled(outcome) = &inner.state {
            return Poll::Ready(outcome.clone().into_result());
        }
        if !inner.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Promise<T> {
    type Output = Result<T, Failure>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        PromiseFuture { promise: self }
    }
}
