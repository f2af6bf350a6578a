//! Tests for the in-memory reservation store

use std::sync::Arc;

use reservation_scheduler::config::SchedulerConfig;
use reservation_scheduler::core::{
    ActiveRequest, ReservationStore, ReserveRequest, SlotPolicy, TokenUsageEntry,
};
use reservation_scheduler::infra::InMemoryStore;

const T0: u64 = 1_700_000_000_000;

fn request(worker: &str, tokens: u64, nonce: String) -> ReserveRequest {
    ReserveRequest {
        worker_id: worker.to_string(),
        estimated_tokens: tokens,
        nonce,
        now_ms: T0,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_never_share_a_slot() {
    let store = Arc::new(InMemoryStore::new());
    let policy = SlotPolicy::from_config(&SchedulerConfig::new(600, 1_000_000));

    let mut tasks = Vec::new();
    for i in 0..64 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            store
                .reserve(&policy, request(&format!("w{}", i % 8), 100, format!("n{i}")))
                .await
                .unwrap()
                .scheduled_ms
        }));
    }
    let mut slots: Vec<u64> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    slots.sort_unstable();

    for pair in slots.windows(2) {
        assert!(pair[1] - pair[0] >= policy.min_spacing_ms, "{pair:?}");
    }
    assert_eq!(store.reservation_times(), slots);
}

#[tokio::test]
async fn test_active_requests_are_tracked() {
    let store = InMemoryStore::new();
    store
        .confirm(
            ActiveRequest {
                id: "a1".into(),
                worker_id: "w".into(),
                started_at_ms: T0,
            },
            40,
        )
        .await
        .unwrap();
    let snap = store.snapshot(T0).await.unwrap();
    assert_eq!(snap.active_requests, 1);
    assert_eq!(snap.counters.confirmed_requests, 1);
    assert_eq!(snap.counters.total_accuracy_ms, 40);

    assert!(store.complete("a1", T0 + 10).await.unwrap());
    assert!(!store.complete("a1", T0 + 10).await.unwrap());
    assert_eq!(store.snapshot(T0 + 10).await.unwrap().active_requests, 0);
}

#[tokio::test]
async fn test_usage_only_counts_in_trailing_window() {
    let store = InMemoryStore::new();
    for (ts, tokens) in [(T0, 100), (T0 + 30_000, 200), (T0 + 59_999, 300)] {
        store
            .record_usage(TokenUsageEntry {
                timestamp_ms: ts,
                token_count: tokens,
            })
            .await
            .unwrap();
    }
    assert_eq!(store.snapshot(T0 + 59_999).await.unwrap().tpm_used, 600);
    assert_eq!(store.snapshot(T0 + 60_000).await.unwrap().tpm_used, 500);
    let snap = store.snapshot(T0 + 90_000).await.unwrap();
    assert_eq!(snap.tpm_used, 300);
    assert_eq!(snap.counters.total_usage_tokens, 600);
}

#[tokio::test]
async fn test_reset_clears_everything() {
    let store = InMemoryStore::new();
    let policy = SlotPolicy::from_config(&SchedulerConfig::new(60, 10_000));
    store.reserve(&policy, request("w", 10, "n".into())).await.unwrap();
    store.reset().await.unwrap();
    let snap = store.snapshot(T0).await.unwrap();
    assert_eq!(snap.rpm_current, 0);
    assert_eq!(snap.tpm_reserved, 0);
    assert_eq!(snap.counters.total_reservations, 0);
    assert_eq!(store.open_holds(), 0);
}
