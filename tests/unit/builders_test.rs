//! Tests for builder modules

use std::sync::Arc;
use std::time::Duration;

use deferred_kernel::builders::{build_fetch_manager, build_persistent_fetcher, build_registry, load_config};
use deferred_kernel::config::{JobQueuePolicy, KernelConfig};
use deferred_kernel::core::{Failure, KernelError, Promise, ResourceFetcher};

fn echo() -> Arc<dyn ResourceFetcher<String>> {
    Arc::new(|key: &str| Promise::with_result(key.to_string()))
}

#[test]
fn test_build_registry_registers_every_queue() {
    let mut cfg = KernelConfig::default();
    cfg.queues.insert("io".to_string(), JobQueuePolicy::serial());
    cfg.queues.insert("cpu".to_string(), JobQueuePolicy::new(2));

    let registry = build_registry::<u32>(&cfg).unwrap();
    assert_eq!(registry.names(), vec!["cpu".to_string(), "io".to_string()]);

    let promise = registry
        .submit("cpu", Arc::new(|| -> Result<u32, Failure> { Ok(7) }))
        .unwrap();
    assert_eq!(promise.join_timeout(Duration::from_secs(5)).unwrap(), 7);
    registry.shutdown();
}

#[test]
fn test_build_registry_rejects_invalid_policy() {
    let mut cfg = KernelConfig::default();
    cfg.queues.insert("broken".to_string(), JobQueuePolicy::new(0));
    assert!(matches!(build_registry::<u32>(&cfg), Err(KernelError::InvalidConfig(_))));
}

#[test]
fn test_build_fetch_manager_uses_fetch_section() {
    let mut cfg = KernelConfig::default();
    cfg.fetch.max_concurrent = 0;
    assert!(matches!(build_fetch_manager(&cfg, echo()), Err(KernelError::InvalidConfig(_))));

    cfg.fetch.max_concurrent = 2;
    let manager = build_fetch_manager(&cfg, echo()).unwrap();
    assert!(manager.is_running());
    manager.stop();
}

#[test]
fn test_build_persistent_fetcher_is_idle() {
    let fetcher = build_persistent_fetcher(&KernelConfig::default(), echo(), "config");
    assert_eq!(fetcher.key(), "config");
    assert!(!fetcher.is_running());
    assert_eq!(fetcher.attempts(), 0);
}

#[test]
fn test_load_config_reports_path() {
    let missing = std::env::temp_dir().join("deferred-kernel-missing-config.json");
    let err = load_config(&missing).unwrap_err();
    assert!(format!("{err:#}").contains("deferred-kernel-missing-config.json"));
}

#[test]
fn test_load_config_reads_file() {
    let path = std::env::temp_dir().join(format!("deferred-kernel-config-{}.json", std::process::id()));
    std::fs::write(&path, r#"{ "retry": { "min_retry_ms": 10, "max_retry_ms": 40 } }"#).unwrap();
    let cfg = load_config(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(cfg.retry.min_retry_ms, 10);
    assert_eq!(cfg.retry.max_retry_ms, 40);
}
