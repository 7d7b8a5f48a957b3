//! Promise kernel, event sources, schedulers, and fetch coordination.

pub mod continuous_task;
pub mod error;
pub mod event_source;
pub mod fetch;
pub mod fetch_manager;
pub mod job_queue;
pub mod persistent_fetcher;
pub mod progress;
pub mod promise;

pub use continuous_task::{drift_corrected_delay, ContinuousTask, TaskDirective, TaskWork};
pub use error::{AppResult, Failure, KernelError};
pub use event_source::{Completer, EventSource, Observer, SubscriptionId};
pub use fetch::{ContentHandler, Fetch, FetchGroup, FetchHandler, PassThrough, ResourceFetcher};
pub use fetch_manager::{FetchManagerStats, ResourceFetchManager};
pub use job_queue::{Job, JobQueue, JobQueueDriver, JobQueueRegistry, JobQueueStats};
pub use persistent_fetcher::{ExponentialBackoff, PersistentFetcher, RetryStrategy, DEFAULT_TICK};
pub use progress::{ProgressEvent, ProgressEventSource, ProgressKind};
pub use promise::{Defer, Outcome, Promise, PromiseFuture, Triggered};
