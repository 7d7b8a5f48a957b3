//! Configuration models for fetch coordination, retries, and job queues.

pub mod kernel;

pub use kernel::{FetchManagerConfig, JobQueuePolicy, KernelConfig, RetryConfig};
