//! Tests for error types

use reservation_scheduler::core::{
    CallError, EstimationError, PoolError, ProcessError, SchedulerError,
};

#[test]
fn test_store_unavailable_error() {
    let err = SchedulerError::StoreUnavailable("connection refused".to_string());
    assert_eq!(format!("{}", err), "store unavailable: connection refused");
}

#[test]
fn test_backend_error() {
    let err = SchedulerError::Backend("reserve script returned an unexpected reply".to_string());
    assert_eq!(
        format!("{}", err),
        "backend error: reserve script returned an unexpected reply"
    );
}

#[test]
fn test_estimation_error() {
    let err = EstimationError("key must be a string".to_string());
    assert_eq!(format!("{}", err), "cannot estimate payload size: key must be a string");
}

#[test]
fn test_execution_error_keeps_message() {
    let err = ProcessError::Execution(anyhow::anyhow!("upstream 500"));
    assert_eq!(format!("{}", err), "external call failed: upstream 500");
}

#[test]
fn test_retries_exhausted_error() {
    let err = ProcessError::RateLimitRetriesExhausted { attempts: 3 };
    assert_eq!(format!("{}", err), "rate limited 3 times, giving up");
}

#[test]
fn test_pool_error_wraps_process_error() {
    let err: PoolError = ProcessError::RateLimitRetriesExhausted { attempts: 1 }.into();
    assert!(matches!(err, PoolError::Process(_)));
    assert_eq!(format!("{}", err), "rate limited 1 times, giving up");
    assert_eq!(format!("{}", PoolError::QueueFull), "queue full");
}

#[test]
fn test_call_error_classification() {
    assert!(CallError::rate_limited("429").is_rate_limit());
    assert!(!CallError::failed("boom").is_rate_limit());
    assert_eq!(format!("{}", CallError::rate_limited("slow down")), "rate limited by provider: slow down");
}
