//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced by the reservation scheduler and its stores.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The shared store could not be reached or rejected the operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The store answered with a reply that could not be decoded.
    #[error("backend error: {0}")]
    Backend(String),
    /// Metric construction or registration failed.
    #[error("metrics error: {0}")]
    Metrics(String),
}

/// The payload size could not be derived for the length heuristic.
#[derive(Debug, Error)]
#[error("cannot estimate payload size: {0}")]
pub struct EstimationError(pub String);

/// Errors that cross the request-processor boundary.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The external call failed for a reason other than a rate limit.
    #[error("external call failed: {0}")]
    Execution(anyhow::Error),
    /// The retry policy gave up after repeated rate-limit rejections.
    #[error("rate limited {attempts} times, giving up")]
    RateLimitRetriesExhausted {
        /// Attempts that were rejected.
        attempts: u32,
    },
}

/// Errors returned by the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The submission queue is at capacity.
    #[error("queue full")]
    QueueFull,
    /// The pool has been shut down.
    #[error("pool is shut down")]
    PoolShutdown,
    /// The worker dropped the unit without replying.
    #[error("worker dropped the unit without a result")]
    WorkerGone,
    /// Internal failure with context.
    #[error("internal error: {0}")]
    Internal(String),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The unit itself failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
}
