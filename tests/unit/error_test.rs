//! Tests for error types

use deferred_kernel::core::{Failure, KernelError};

#[test]
fn test_queue_not_found_error() {
    let err = KernelError::QueueNotFound("io".to_string());
    assert_eq!(format!("{err}"), "queue not found: io");
}

#[test]
fn test_duplicate_queue_error() {
    let err = KernelError::DuplicateQueue("io".to_string());
    assert_eq!(format!("{err}"), "queue already registered: io");
}

#[test]
fn test_invalid_config_error() {
    let err = KernelError::InvalidConfig("max_concurrent must be greater than 0".to_string());
    assert_eq!(
        format!("{err}"),
        "invalid configuration: max_concurrent must be greater than 0"
    );
}

#[test]
fn test_simple_variants() {
    assert_eq!(format!("{}", KernelError::AlreadySettled), "promise already settled");
    assert_eq!(format!("{}", KernelError::Canceled), "canceled");
    assert_eq!(format!("{}", KernelError::Timeout), "operation timed out");
    assert_eq!(format!("{}", KernelError::Shutdown), "shut down");
}

#[test]
fn test_spawn_error_keeps_source() {
    let err = KernelError::Spawn(std::io::Error::new(std::io::ErrorKind::OutOfMemory, "no threads"));
    assert!(format!("{err}").starts_with("failed to spawn thread"));
    assert!(std::error::Error::source(&err).is_some());
}

#[test]
fn test_failure_from_kernel_error() {
    let failure = Failure::from(KernelError::Canceled);
    assert!(failure.is_canceled());
    assert!(!failure.is_timeout());
    assert_eq!(failure.to_string(), "canceled");
}

#[test]
fn test_failure_from_anyhow_keeps_context() {
    let err = anyhow::anyhow!("disk full").context("writing cache");
    let failure = Failure::from_anyhow(err);
    assert_eq!(failure.to_string(), "writing cache");
    assert_eq!(failure.inner().root_cause().to_string(), "disk full");
}

#[test]
fn test_failure_clones_share_error() {
    let failure = Failure::msg("shared");
    let copy = failure.clone();
    assert_eq!(copy.to_string(), failure.to_string());
    assert!(copy.downcast_ref::<KernelError>().is_none());
}
