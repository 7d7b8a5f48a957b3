//! Tokio bridge: spawning futures as promises and async fetchers.
//!
//! Awaiting a [`Promise`](crate::core::Promise) needs no runtime support; it
//! implements `IntoFuture` directly.

pub mod async_fetch;
pub mod tokio_spawner;

pub use async_fetch::{AsyncFetcher, AsyncFetcherAdapter};
pub use tokio_spawner::TokioSpawner;
