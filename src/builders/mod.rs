//! Builders to construct kernel components from configuration.

pub mod kernel_builder;

pub use kernel_builder::{build_fetch_manager, build_persistent_fetcher, build_registry, load_config};
