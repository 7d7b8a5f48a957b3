//! Builders to construct kernel components from configuration.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::config::KernelConfig;
use crate::core::{
    AppResult, JobQueueRegistry, KernelError, PersistentFetcher, ResourceFetchManager, ResourceFetcher,
};

/// Read and validate a JSON configuration file.
///
/// # Errors
///
/// Returns the I/O, parse or validation error with the path as context.
pub fn load_config(path: impl AsRef<Path>) -> AppResult<KernelConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading kernel config {}", path.display()))?;
    KernelConfig::from_json_str(&raw)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("loading kernel config {}", path.display()))
}

/// Register and start every queue named in `cfg.queues`.
///
/// # Errors
///
/// Returns [`KernelError::InvalidConfig`] if the configuration is invalid,
/// or the first registration error.
pub fn build_registry<T>(cfg: &KernelConfig) -> Result<JobQueueRegistry<T>, KernelError>
where
    T: Clone + Send + 'static,
{
    cfg.validate().map_err(KernelError::InvalidConfig)?;

    let registry = JobQueueRegistry::new();
    let mut names: Vec<_> = cfg.queues.keys().collect();
    names.sort();
    for name in names {
        let policy = &cfg.queues[name];
        if let Err(e) = registry.register(name, policy) {
            registry.shutdown();
            return Err(e);
        }
        debug!(queue = %name, workers = policy.max_concurrent_jobs, "queue built from config");
    }
    Ok(registry)
}

/// Create a started fetch manager using `cfg.fetch`.
///
/// # Errors
///
/// Any error from [`ResourceFetchManager::new`].
pub fn build_fetch_manager<T>(
    cfg: &KernelConfig,
    default_fetcher: Arc<dyn ResourceFetcher<T>>,
) -> Result<ResourceFetchManager<T>, KernelError>
where
    T: Clone + Send + 'static,
{
    ResourceFetchManager::new(cfg.fetch.clone(), default_fetcher)
}

/// Create an idle persistent fetcher using `cfg.retry`.
pub fn build_persistent_fetcher<T>(
    cfg: &KernelConfig,
    fetcher: Arc<dyn ResourceFetcher<T>>,
    key: impl Into<String>,
) -> PersistentFetcher<T>
where
    T: Clone + Send + 'static,
{
    PersistentFetcher::with_config(fetcher, key, &cfg.retry)
}
