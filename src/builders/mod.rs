//! Builders to construct scheduler components from configuration.

pub mod scheduler_builder;

pub use scheduler_builder::{build_exporter, build_scheduler, build_store, build_worker_pool};
