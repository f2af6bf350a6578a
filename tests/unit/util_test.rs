//! Tests for utility functions

use std::time::Duration;

use reservation_scheduler::util::{init_tracing, now_ms, Clock, ManualClock, SystemClock, TokioClock};

#[test]
fn test_manual_clock() {
    let clock = ManualClock::new(10_000);
    assert_eq!(clock.now_ms(), 10_000);
    clock.advance(Duration::from_secs(2));
    assert_eq!(clock.now_ms(), 12_000);
}

#[test]
fn test_system_clock_matches_now_ms() {
    let a = now_ms();
    let b = SystemClock.now_ms();
    assert!(b >= a);
    assert!(b - a < 5_000);
}

#[tokio::test(start_paused = true)]
async fn test_tokio_clock_follows_paused_time() {
    let clock = TokioClock::new(1_000);
    assert_eq!(clock.now_ms(), 1_000);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(clock.now_ms(), 2_500);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
}
