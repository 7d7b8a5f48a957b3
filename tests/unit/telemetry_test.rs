//! Tests for telemetry helpers

use deferred_kernel::util::{init_tracing, init_tracing_with_filter};

#[test]
fn test_tracing_installs_once() {
    assert!(init_tracing_with_filter("deferred_kernel=debug"));
    assert!(!init_tracing_with_filter("deferred_kernel=trace"));
    init_tracing();
}
