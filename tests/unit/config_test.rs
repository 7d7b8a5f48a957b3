//! Tests for configuration validation

use std::collections::HashMap;
use std::time::Duration;

use deferred_kernel::config::{FetchManagerConfig, JobQueuePolicy, KernelConfig, RetryConfig};
use deferred_kernel::core::KernelError;

#[test]
fn test_fetch_config_defaults() {
    let config = FetchManagerConfig::default();
    assert_eq!(config.max_concurrent, 4);
    assert_eq!(config.idle_wait(), Duration::from_millis(50));
    assert!(config.validate().is_ok());
}

#[test]
fn test_fetch_config_invalid_values() {
    assert!(FetchManagerConfig::new().with_max_concurrent(0).validate().is_err());
    assert!(FetchManagerConfig::new().with_idle_wait_ms(0).validate().is_err());
}

#[test]
fn test_retry_config_bounds() {
    let config = RetryConfig::new();
    assert_eq!(config.min_retry(), Duration::from_secs(1));
    assert_eq!(config.max_retry(), Duration::from_secs(30));
    assert_eq!(config.tick(), Duration::from_millis(100));
    assert!(config.validate().is_ok());

    assert!(RetryConfig::new().with_bounds_ms(0, 10).validate().is_err());
    assert!(RetryConfig::new().with_bounds_ms(50, 10).validate().is_err());
    assert!(RetryConfig::new().with_tick_ms(0).validate().is_err());
}

#[test]
fn test_job_queue_policy_validation() {
    assert!(JobQueuePolicy::default().max_concurrent_jobs >= 1);
    assert_eq!(JobQueuePolicy::serial().max_concurrent_jobs, 1);
    assert!(JobQueuePolicy::new(0).validate().is_err());
    assert!(JobQueuePolicy::new(2).with_thread_stack_size(1024).validate().is_err());
    assert!(JobQueuePolicy::new(2).with_thread_stack_size(256 * 1024).validate().is_ok());
}

#[test]
fn test_kernel_config_from_json_with_defaults() {
    let cfg = KernelConfig::from_json_str(
        r#"{
            "fetch": { "max_concurrent": 8 },
            "queues": { "io": { "max_concurrent_jobs": 2 } }
        }"#,
    )
    .unwrap();
    assert_eq!(cfg.fetch.max_concurrent, 8);
    assert_eq!(cfg.fetch.idle_wait_ms, 50);
    assert_eq!(cfg.retry, RetryConfig::default());
    assert_eq!(cfg.queues["io"].max_concurrent_jobs, 2);
    assert_eq!(cfg.queues["io"].thread_stack_size, 2 * 1024 * 1024);
}

#[test]
fn test_kernel_config_from_json_rejects_invalid() {
    let err = KernelConfig::from_json_str(r#"{ "queues": { "io": { "max_concurrent_jobs": 0 } } }"#).unwrap_err();
    assert!(err.contains("queue `io` invalid"));

    let err = KernelConfig::from_json_str("{ not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}

#[test]
fn test_kernel_config_from_lookup_overrides() {
    let vars: HashMap<&str, &str> = [
        ("KERNEL_FETCH_MAX_CONCURRENT", "6"),
        ("KERNEL_RETRY_MIN_MS", "200"),
        ("KERNEL_RETRY_MAX_MS", "800"),
    ]
    .into_iter()
    .collect();
    let cfg = KernelConfig::from_lookup(|key| vars.get(key).map(|value| (*value).to_string())).unwrap();
    assert_eq!(cfg.fetch.max_concurrent, 6);
    assert_eq!(cfg.fetch.idle_wait_ms, 50);
    assert_eq!(cfg.retry.min_retry_ms, 200);
    assert_eq!(cfg.retry.max_retry_ms, 800);
    assert_eq!(cfg.retry.tick_ms, 100);
}

#[test]
fn test_kernel_config_from_lookup_rejects_bad_values() {
    let not_a_number = KernelConfig::from_lookup(|key| (key == "KERNEL_FETCH_IDLE_WAIT_MS").then(|| "soon".to_string()));
    assert!(matches!(not_a_number, Err(KernelError::InvalidConfig(_))));

    let zero = KernelConfig::from_lookup(|key| (key == "KERNEL_FETCH_MAX_CONCURRENT").then(|| "0".to_string()));
    assert!(matches!(zero, Err(KernelError::InvalidConfig(_))));
}

#[test]
fn test_kernel_config_roundtrips_through_json() {
    let mut cfg = KernelConfig::default();
    cfg.queues.insert("cpu".to_string(), JobQueuePolicy::new(3));
    let json = serde_json::to_string(&cfg).unwrap();
    assert_eq!(KernelConfig::from_json_str(&json).unwrap(), cfg);
}
