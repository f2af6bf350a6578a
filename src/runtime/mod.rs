//! Tokio runtime adapters: the worker pool that drives request processors.

pub mod worker_pool;

pub use worker_pool::{PoolStats, WorkerPool};
