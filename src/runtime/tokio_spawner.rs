//! Tokio runtime spawner that settles promises from futures.

use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::core::{Defer, Failure, KernelError, Promise};

/// Runs futures on a tokio runtime and exposes their results as promises.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
    // Keeps an owned runtime alive for as long as any clone exists.
    _runtime: Option<Arc<tokio::runtime::Runtime>>,
}

impl TokioSpawner {
    /// Create a spawner from an existing runtime handle.
    #[must_use]
    pub const fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            _runtime: None,
        }
    }

    /// Create a spawner for the runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// Fails when called outside a tokio runtime.
    pub fn current() -> Result<Self, tokio::runtime::TryCurrentError> {
        tokio::runtime::Handle::try_current().map(Self::new)
    }

    /// Create a spawner owning a new multi-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from building the runtime.
    pub fn with_worker_threads(worker_threads: usize) -> Result<Self, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("kernel-tokio")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            _runtime: Some(Arc::new(runtime)),
        })
    }

    /// The underlying runtime handle.
    #[must_use]
    pub const fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    /// Spawn `fut` and return a promise settled with its output.
    ///
    /// A panic inside `fut` rejects the promise with [`KernelError::Panicked`].
    pub fn spawn_promise<T, F>(&self, fut: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        let defer = Defer::new();
        let promise = defer.promise();
        let task = self.handle.spawn(fut);
        self.handle.spawn(async move {
            settle_from(&defer, task.await);
        });
        promise
    }
}

fn settle_from<T: Clone + Send + 'static>(
    defer: &Defer<T>,
    joined: Result<Result<T, Failure>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(value)) => {
            defer.resolve(value);
        }
        Ok(Err(failure)) => {
            defer.reject(failure);
        }
        Err(join_error) => {
            warn!(error = %join_error, "spawned promise task did not complete");
            defer.reject(KernelError::Panicked(join_error.to_string()));
        }
    }
}
