//! Error types for kernel operations.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors produced by kernel components themselves.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A deferred was settled more than once.
    #[error("promise already settled")]
    AlreadySettled,
    /// Work was removed from its queue before it could run.
    #[error("canceled")]
    Canceled,
    /// A blocking wait gave up before the promise settled.
    #[error("operation timed out")]
    Timeout,
    /// No queue is registered under the given name.
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    /// A queue with the given name is already registered.
    #[error("queue already registered: {0}")]
    DuplicateQueue(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The component has been shut down.
    #[error("shut down")]
    Shutdown,
    /// User code panicked while running inside the kernel.
    #[error("panicked: {0}")]
    Panicked(String),
    /// A kernel thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl KernelError {
    /// Describe a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked(message)
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

/// The error carried by a rejected promise.
///
/// Rejections are observed by every link of a chain and by every late
/// subscriber, so the error is shared behind an `Arc` and clones are cheap.
/// Any standard error converts into a `Failure`, which lets continuations use
/// `?` on ordinary fallible calls; `anyhow` errors go through
/// [`Failure::from_anyhow`].
#[derive(Clone)]
pub struct Failure(Arc<anyhow::Error>);

impl Failure {
    /// Wrap an error value.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::new(error)))
    }

    /// Build a failure from a plain message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    /// Wrap an `anyhow` error, keeping its context chain.
    #[must_use]
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    /// Borrow the underlying `anyhow` error.
    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempt to view the root error as a concrete type.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// True when this failure records a queue cancellation.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self.downcast_ref::<KernelError>(), Some(KernelError::Canceled))
    }

    /// True when this failure records a timed-out wait.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.downcast_ref::<KernelError>(), Some(KernelError::Timeout))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl<E> From<E> for Failure
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}
