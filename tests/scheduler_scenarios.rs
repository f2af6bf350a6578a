//! End-to-end scheduling scenarios against the in-memory store.
//!
//! Time is driven by a [`ManualClock`] so every grant is deterministic.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reservation_scheduler::config::SchedulerConfig;
use reservation_scheduler::core::slot::{in_window, WINDOW_MS};
use reservation_scheduler::core::{
    plan_slot, Bottleneck, ReservationScheduler, SlotPolicy, WindowView,
};
use reservation_scheduler::infra::InMemoryStore;
use reservation_scheduler::util::ManualClock;

const T0: u64 = 1_700_000_000_000;

fn setup(config: &SchedulerConfig) -> (ReservationScheduler, Arc<ManualClock>, Arc<InMemoryStore>) {
    let clock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(InMemoryStore::new());
    let scheduler = ReservationScheduler::new(config, store.clone())
        .unwrap()
        .with_clock(clock.clone());
    (scheduler, clock, store)
}

fn max_in_any_window(slots: &[u64]) -> usize {
    slots
        .iter()
        .map(|&end| slots.iter().filter(|&&t| in_window(t, end)).count())
        .max()
        .unwrap_or(0)
}

fn max_tokens_in_any_window(entries: &[(u64, u64)]) -> u64 {
    entries
        .iter()
        .map(|&(end, _)| {
            entries
                .iter()
                .filter(|&&(t, _)| in_window(t, end))
                .map(|&(_, n)| n)
                .sum::<u64>()
        })
        .max()
        .unwrap_or(0)
}

// ============================================================================
// Request budget
// ============================================================================

#[tokio::test]
async fn test_burst_is_spread_over_the_window() {
    // 60 rpm at 50% headroom: 30 per minute, one per second.
    let config = SchedulerConfig::new(60, 1_000_000).with_headroom(0.5);
    let (scheduler, _clock, _store) = setup(&config);

    let mut slots = Vec::new();
    for _ in 0..40 {
        let grant = scheduler.reserve_slot("w", 100).await;
        assert!(grant.guaranteed);
        slots.push(grant.scheduled_ms);
    }

    assert_eq!(slots[0], T0);
    for pair in slots[..30].windows(2) {
        let gap = pair[1] - pair[0];
        assert!((1_000..=1_030).contains(&gap), "gap {gap}");
    }
    assert!(slots[30..].iter().all(|&t| t >= T0 + WINDOW_MS));
    assert!(max_in_any_window(&slots) <= 30);
}

#[tokio::test]
async fn test_same_worker_in_one_second_pays_the_penalty() {
    let config = SchedulerConfig::new(60, 1_000_000)
        .with_headroom(0.5)
        .with_worker_slot_penalty_ms(30);
    let (scheduler, _clock, _store) = setup(&config);

    let first = scheduler.reserve_slot("w", 100).await;
    let second = scheduler.reserve_slot("w", 100).await;
    let other = scheduler.reserve_slot("other", 100).await;

    assert_eq!(first.scheduled_ms, T0);
    assert_eq!(second.scheduled_ms, T0 + 1_030);
    assert_eq!(other.scheduled_ms, T0 + 2_030);
}

#[tokio::test]
async fn test_random_arrivals_never_overfill_a_window() {
    let config = SchedulerConfig::new(120, 10_000_000).with_headroom(0.9);
    let safe_rpm = usize::try_from(config.safe_rpm()).unwrap();
    let (scheduler, clock, _store) = setup(&config);
    let mut rng = StdRng::seed_from_u64(42);

    let mut slots = Vec::new();
    for _ in 0..400 {
        clock.advance(Duration::from_millis(rng.random_range(0..400)));
        let worker = format!("w{}", rng.random_range(0..6));
        let grant = scheduler.reserve_slot(&worker, 50).await;
        slots.push(grant.scheduled_ms);
    }
    slots.sort_unstable();

    assert!(max_in_any_window(&slots) <= safe_rpm);
    let spacing = scheduler.policy().min_spacing_ms;
    assert!(slots.windows(2).all(|p| p[1] - p[0] >= spacing));
}

#[tokio::test]
async fn test_stream_at_the_budget_never_waits() {
    // 30 per minute arriving every two seconds: exactly the safe rate.
    let config = SchedulerConfig::new(60, 1_000_000).with_headroom(0.5);
    let (scheduler, clock, _store) = setup(&config);

    let mut slots = Vec::new();
    for i in 0..200 {
        let grant = scheduler.reserve_slot(&format!("w{}", i % 3), 100).await;
        assert_eq!(grant.wait_ms, 0, "request {i}");
        slots.push(grant.scheduled_ms);
        clock.advance(Duration::from_millis(2_000));
    }
    assert!(max_in_any_window(&slots) <= 30);
}

#[tokio::test]
async fn test_burst_waits_are_bounded() {
    let config = SchedulerConfig::new(60, 1_000_000).with_headroom(0.5);
    let (scheduler, _clock, _store) = setup(&config);
    let bound = 2 * (WINDOW_MS + scheduler.policy().min_spacing_ms);

    for i in 0..60 {
        let grant = scheduler.reserve_slot(&format!("w{i}"), 100).await;
        assert!(grant.wait_ms <= bound, "request {i} waited {}", grant.wait_ms);
    }
}

#[tokio::test]
async fn test_concurrent_reservations_get_distinct_slots() {
    let config = SchedulerConfig::new(600, 1_000_000);
    let (scheduler, _clock, _store) = setup(&config);

    let grants = futures::future::join_all(
        (0..20).map(|i| {
            let scheduler = scheduler.clone();
            async move { scheduler.reserve_slot(&format!("w{i}"), 100).await }
        }),
    )
    .await;

    let mut slots: Vec<u64> = grants.iter().map(|g| g.scheduled_ms).collect();
    slots.sort_unstable();
    let spacing = scheduler.policy().min_spacing_ms;
    assert!(slots.windows(2).all(|p| p[1] - p[0] >= spacing));
}

// ============================================================================
// Token budget
// ============================================================================

#[tokio::test]
async fn test_released_hold_makes_room_for_a_new_reservation() {
    let config = SchedulerConfig::new(600, 10_000).with_headroom(1.0);
    let (scheduler, clock, store) = setup(&config);

    let big = scheduler.reserve_slot("w1", 6_000).await;
    assert_eq!(big.scheduled_ms, T0);

    let blocked = scheduler.reserve_slot("w2", 5_000).await;
    assert!(blocked.scheduled_ms >= T0 + WINDOW_MS);

    // The first call finishes at its slot; its usage stays out of the blocked
    // hold's window.
    scheduler.record_token_usage(5_000, 1_000).await;
    assert!(scheduler.finalize_token_reservation(big.handle.as_ref().unwrap()).await);
    assert_eq!(store.open_holds(), 1);

    clock.advance(Duration::from_millis(1_000));

    let small = scheduler.reserve_slot("w3", 3_000).await;
    assert_eq!(small.wait_ms, 0);
    assert_eq!(small.scheduled_ms, T0 + 1_000);
}

#[tokio::test]
async fn test_backfill_keeps_later_token_windows_in_budget() {
    let config = SchedulerConfig::new(600, 10_000).with_headroom(1.0);
    let (scheduler, _clock, _store) = setup(&config);

    let mut granted = Vec::new();
    for (worker, estimate) in [("w1", 3_000), ("w2", 8_000), ("w3", 7_000)] {
        let grant = scheduler.reserve_slot(worker, estimate).await;
        assert!(grant.guaranteed);
        let handle = grant.handle.unwrap();
        granted.push((handle.scheduled_ms, handle.estimated_tokens));
    }

    assert_eq!(granted[0].0, T0);
    assert_eq!(granted[1].0, T0 + WINDOW_MS);
    assert_eq!(granted[2].0, T0 + 2 * WINDOW_MS);
    assert!(max_tokens_in_any_window(&granted) <= 10_000);
}

#[test]
fn test_planned_slots_respect_the_token_budget() {
    let policy = SlotPolicy::from_config(&SchedulerConfig::new(6_000, 10_000).with_headroom(1.0));
    let mut rng = StdRng::seed_from_u64(7);
    let mut reservations: Vec<u64> = Vec::new();
    let mut tokens: Vec<(u64, u64)> = Vec::new();
    let mut now = T0;

    for _ in 0..200 {
        now += rng.random_range(0..500);
        let estimate = rng.random_range(1..4_000);
        let plan = plan_slot(
            &policy,
            WindowView {
                reservations: &reservations,
                tokens: &tokens,
                worker_in_bucket: false,
            },
            now,
            estimate,
        );

        assert!(plan.scheduled_ms >= now);

        let at = reservations.partition_point(|&t| t <= plan.scheduled_ms);
        reservations.insert(at, plan.scheduled_ms);
        tokens.push((plan.scheduled_ms, plan.estimated_tokens));

        let worst = max_tokens_in_any_window(&tokens);
        assert!(worst <= policy.safe_tpm, "window holds {worst} tokens");
    }
}

#[tokio::test]
async fn test_oversized_estimate_is_clamped() {
    let config = SchedulerConfig::new(600, 10_000).with_headroom(1.0);
    let (scheduler, _clock, _store) = setup(&config);

    let grant = scheduler.reserve_slot("w", 50_000).await;
    assert!(grant.guaranteed);
    assert_eq!(grant.wait_ms, 0);
    assert_eq!(grant.handle.unwrap().estimated_tokens, 10_000);
}

#[tokio::test]
async fn test_finalize_is_idempotent() {
    let config = SchedulerConfig::new(600, 10_000);
    let (scheduler, _clock, store) = setup(&config);

    let grant = scheduler.reserve_slot("w", 1_000).await;
    let handle = grant.handle.unwrap();
    assert!(scheduler.finalize_token_reservation(&handle).await);
    assert!(!scheduler.finalize_token_reservation(&handle).await);
    assert_eq!(store.open_holds(), 0);
}

// ============================================================================
// Metrics and reset
// ============================================================================

#[tokio::test]
async fn test_metrics_report_confirmation_and_accuracy() {
    let config = SchedulerConfig::new(60, 1_000_000).with_headroom(0.5);
    let (scheduler, clock, _store) = setup(&config);

    let a = scheduler.reserve_slot("a", 100).await;
    let b = scheduler.reserve_slot("b", 100).await;
    let _c = scheduler.reserve_slot("c", 100).await;

    clock.set(a.scheduled_ms + 10);
    let ticket_a = scheduler.confirm_reservation("a", a.scheduled_ms).await;
    clock.set(b.scheduled_ms + 30);
    let ticket_b = scheduler.confirm_reservation("b", b.scheduled_ms).await;
    assert_eq!(ticket_a.accuracy_ms, 10);
    assert_eq!(ticket_b.accuracy_ms, 30);

    let m = scheduler.get_metrics().await.unwrap();
    assert_eq!(m.total_reservations, 3);
    assert_eq!(m.confirmed_requests, 2);
    assert_eq!(m.active_requests, 2);
    assert!((m.confirmation_rate_percent - 200.0 / 3.0).abs() < 1e-9);
    assert!((m.average_accuracy_ms - 20.0).abs() < 1e-9);
    assert_eq!(m.rpm_safe, 30);
    assert_eq!(m.rpm_max, 60);
    assert_eq!(m.bottleneck, Bottleneck::None);

    scheduler.complete_request(&ticket_a).await;
    assert_eq!(scheduler.get_metrics().await.unwrap().active_requests, 1);
}

#[tokio::test]
async fn test_metrics_identify_the_bottleneck() {
    let config = SchedulerConfig::new(10, 1_000_000).with_headroom(1.0);
    let (scheduler, clock, _store) = setup(&config);
    for i in 0..9 {
        scheduler.reserve_slot(&format!("w{i}"), 100).await;
    }
    clock.advance(Duration::from_millis(8_000));

    let m = scheduler.get_metrics().await.unwrap();
    assert_eq!(m.rpm_current, 9);
    assert!((m.rpm_utilization_percent - 90.0).abs() < 1e-9);
    assert_eq!(m.bottleneck, Bottleneck::Rpm);

    let config = SchedulerConfig::new(600, 10_000).with_headroom(1.0);
    let (scheduler, _clock, _store) = setup(&config);
    scheduler.reserve_slot("w", 9_000).await;
    let m = scheduler.get_metrics().await.unwrap();
    assert_eq!(m.tpm_reserved, 9_000);
    assert_eq!(m.bottleneck, Bottleneck::Tpm);
}

#[tokio::test]
async fn test_reset_clears_the_timeline() {
    let config = SchedulerConfig::new(60, 1_000_000).with_headroom(0.5);
    let (scheduler, _clock, store) = setup(&config);
    for i in 0..5 {
        scheduler.reserve_slot(&format!("w{i}"), 100).await;
    }
    scheduler.reset().await.unwrap();

    let m = scheduler.get_metrics().await.unwrap();
    assert_eq!(m.total_reservations, 0);
    assert_eq!(m.tpm_reserved, 0);
    assert!(store.reservation_times().is_empty());

    let grant = scheduler.reserve_slot("w0", 100).await;
    assert_eq!(grant.wait_ms, 0);
}
