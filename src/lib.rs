//! # Deferred Kernel
//!
//! A small concurrency kernel built around single-assignment promises.
//!
//! Producers settle a [`Defer`](core::Defer) from whatever thread finishes the
//! work; consumers chain continuations on the matching
//! [`Promise`](core::Promise), block on it, or `.await` it. Everything else in
//! the crate is expressed in terms of promises:
//!
//! - **EventSource**: multi-observer notification with last-value replay,
//!   bridged to promises via `wait_for_next_event` and `to_promise`
//! - **ContinuousTask**: a timer-driven task whose work returns a directive
//!   promise (stop, interval, no delay, explicit delay), with drift correction
//! - **PersistentFetcher**: retries one fetch with exponential backoff until
//!   it succeeds or is canceled
//! - **JobQueue**: explicit, cancelable FIFO work queue with per-job promises,
//!   driven by worker threads through a named-queue registry
//! - **ResourceFetchManager**: runs fetch groups with bounded concurrency and
//!   publishes aggregate progress
//!
//! ## Promises
//!
//! ```rust,ignore
//! use deferred_kernel::core::{Failure, Promise};
//!
//! let defer = Promise::<u32>::defer();
//! let doubled = defer.promise().then(|p| {
//!     let value = p.result().copied().ok_or_else(|| Failure::msg("missing"))?;
//!     p.succeed_with(value * 2);
//!     Ok(())
//! });
//!
//! std::thread::spawn(move || defer.resolve(21));
//! assert_eq!(doubled.join()?, 42);
//! ```
//!
//! ## Job queues
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use deferred_kernel::config::JobQueuePolicy;
//! use deferred_kernel::core::{Failure, JobQueueRegistry};
//!
//! let registry = JobQueueRegistry::<String>::new();
//! registry.register("thumbnails", &JobQueuePolicy::new(2))?;
//! let rendered = registry.submit("thumbnails", Arc::new(|| -> Result<String, Failure> {
//!     Ok("done".to_string())
//! }))?;
//! assert_eq!(rendered.join()?, "done");
//! registry.shutdown();
//! ```
//!
//! ## Fetch coordination
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use deferred_kernel::config::FetchManagerConfig;
//! use deferred_kernel::core::{FetchGroup, PassThrough, Promise, ResourceFetchManager, ResourceFetcher};
//!
//! let fetcher: Arc<dyn ResourceFetcher<Vec<u8>>> =
//!     Arc::new(|key: &str| Promise::with_result(key.as_bytes().to_vec()));
//! let manager = ResourceFetchManager::new(FetchManagerConfig::new().with_max_concurrent(4), fetcher)?;
//! let done = manager.progress().on_complete_promise();
//! manager.add(Arc::new(FetchGroup::new(["a.png", "b.png"], PassThrough)));
//! assert!(done.join()?);
//! ```
//!
//! Logging goes through `tracing`; call
//! [`util::telemetry::init_tracing`] to install a default subscriber.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Promises, event sources, schedulers, job queues, and fetch coordination.
pub mod core;
/// Configuration models for fetching, retries, and job queues.
pub mod config;
/// Builders to construct kernel components from configuration.
pub mod builders;
/// Tokio bridge for spawning futures as promises and async fetchers.
#[cfg(feature = "tokio-runtime")]
pub mod runtime;
/// Shared utilities.
pub mod util;
