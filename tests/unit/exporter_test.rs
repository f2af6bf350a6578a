//! Tests for the metrics exporter

use std::sync::Arc;

use async_trait::async_trait;
use reservation_scheduler::config::{ExporterConfig, SchedulerConfig};
use reservation_scheduler::core::{
    ActiveRequest, Bottleneck, ReservationScheduler, ReservationStore, ReserveOutcome,
    ReserveRequest, SchedulerError, SlotPolicy, TokenHandle, TokenUsageEntry, WindowSnapshot,
};
use reservation_scheduler::infra::InMemoryStore;
use reservation_scheduler::metrics::{CallOutcome, MetricsExporter};
use reservation_scheduler::util::ManualClock;

const T0: u64 = 1_700_000_000_000;

/// Store whose every operation fails.
#[derive(Debug)]
struct DownStore;

#[async_trait]
impl ReservationStore for DownStore {
    async fn reserve(&self, _: &SlotPolicy, _: ReserveRequest) -> Result<ReserveOutcome, SchedulerError> {
        Err(SchedulerError::StoreUnavailable("down".into()))
    }
    async fn confirm(&self, _: ActiveRequest, _: u64) -> Result<(), SchedulerError> {
        Err(SchedulerError::StoreUnavailable("down".into()))
    }
    async fn complete(&self, _: &str, _: u64) -> Result<bool, SchedulerError> {
        Err(SchedulerError::StoreUnavailable("down".into()))
    }
    async fn record_usage(&self, _: TokenUsageEntry) -> Result<(), SchedulerError> {
        Err(SchedulerError::StoreUnavailable("down".into()))
    }
    async fn release_tokens(&self, _: &TokenHandle, _: u64) -> Result<bool, SchedulerError> {
        Err(SchedulerError::StoreUnavailable("down".into()))
    }
    async fn snapshot(&self, _: u64) -> Result<WindowSnapshot, SchedulerError> {
        Err(SchedulerError::StoreUnavailable("down".into()))
    }
    async fn reset(&self) -> Result<(), SchedulerError> {
        Err(SchedulerError::StoreUnavailable("down".into()))
    }
}

fn scheduler(store: Arc<dyn ReservationStore>) -> ReservationScheduler {
    ReservationScheduler::new(&SchedulerConfig::new(60, 10_000).with_headroom(0.5), store)
        .unwrap()
        .with_clock(Arc::new(ManualClock::new(T0)))
}

#[test]
fn test_exporter_rejects_invalid_namespace() {
    let cfg = ExporterConfig {
        namespace: "has space".into(),
        ..ExporterConfig::default()
    };
    assert!(MetricsExporter::new(&cfg).is_err());
}

#[tokio::test]
async fn test_scrape_publishes_gauges() {
    let exporter = MetricsExporter::new(&ExporterConfig::default()).unwrap();
    let scheduler = scheduler(Arc::new(InMemoryStore::new()));
    for worker in ["a", "b", "c"] {
        scheduler.reserve_slot(worker, 1_000).await;
    }

    assert!(exporter.scrape(&scheduler).await);
    let text = exporter.render().unwrap();
    assert!(text.contains("reservation_scheduler_rpm_safe 30"));
    assert!(text.contains("reservation_scheduler_tpm_safe 5000"));
    assert!(text.contains("reservation_scheduler_tpm_reserved 3000"));
    assert!(text.contains("reservation_scheduler_rpm_current 1"));
    assert!(text.contains("reservation_scheduler_reservations_total 3"));
    assert!(text.contains("reservation_scheduler_bottleneck{resource=\"none\"} 1"));
    assert!(text.contains("reservation_scheduler_bottleneck{resource=\"rpm\"} 0"));
}

#[tokio::test]
async fn test_scrape_failure_is_counted_not_raised() {
    let exporter = MetricsExporter::new(&ExporterConfig::default()).unwrap();
    let scheduler = scheduler(Arc::new(DownStore));
    assert!(!exporter.scrape(&scheduler).await);
    assert!(!exporter.scrape(&scheduler).await);
    assert_eq!(exporter.scrape_error_count(), 2);
}

#[test]
fn test_outcomes_and_waits_are_recorded() {
    let exporter = MetricsExporter::new(&ExporterConfig::default()).unwrap();
    exporter.record_outcome(CallOutcome::Success);
    exporter.record_outcome(CallOutcome::Success);
    exporter.record_outcome(CallOutcome::RateLimit);
    exporter.observe_wait(true, 250);
    exporter.observe_wait(false, 1_500);

    assert_eq!(exporter.outcome_count(CallOutcome::Success), 2);
    assert_eq!(exporter.outcome_count(CallOutcome::RateLimit), 1);
    assert_eq!(exporter.outcome_count(CallOutcome::Error), 0);

    let text = exporter.render().unwrap();
    assert!(text.contains("reservation_scheduler_call_outcomes_total{outcome=\"rate_limit\"} 1"));
    assert!(text.contains("reservation_scheduler_wait_time_seconds_count{guaranteed=\"false\"} 1"));
    assert!(text.contains("reservation_scheduler_wait_time_seconds_count{guaranteed=\"true\"} 1"));
}

#[tokio::test(start_paused = true)]
async fn test_spawned_exporter_scrapes_until_stopped() {
    let exporter = Arc::new(MetricsExporter::new(&ExporterConfig::default()).unwrap());
    let scheduler = Arc::new(scheduler(Arc::new(DownStore)));
    let handle = Arc::clone(&exporter).spawn(scheduler);

    // First tick fires immediately, then every 15s.
    tokio::time::sleep(std::time::Duration::from_secs(31)).await;
    handle.stop().await;
    let scrapes = exporter.scrape_error_count();
    assert_eq!(scrapes, 3);

    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    assert_eq!(exporter.scrape_error_count(), scrapes);
}

#[test]
fn test_bottleneck_labels() {
    assert_eq!(Bottleneck::Rpm.as_str(), "rpm");
    assert_eq!(Bottleneck::Tpm.as_str(), "tpm");
    assert_eq!(Bottleneck::None.as_str(), "none");
}
