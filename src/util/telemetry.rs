//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, unless one is already set.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}

/// Install a `fmt` subscriber with an explicit filter such as
/// `"deferred_kernel=debug"`, unless one is already set.
///
/// Returns `false` when the filter does not parse or a subscriber exists.
pub fn init_tracing_with_filter(filter: &str) -> bool {
    if tracing::dispatcher::has_been_set() {
        return false;
    }
    let Ok(filter) = EnvFilter::try_new(filter) else {
        return false;
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
