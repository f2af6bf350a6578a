//! Tests for builder modules

use reservation_scheduler::builders::{build_exporter, build_scheduler, build_store};
use reservation_scheduler::config::{AppConfig, StoreBackendConfig};

#[tokio::test]
async fn test_build_scheduler_in_memory() {
    let cfg = AppConfig::from_json_str(
        r#"{"scheduler": {"max_requests_per_minute": 120, "max_tokens_per_minute": 50000}}"#,
    )
    .unwrap();
    let scheduler = build_scheduler(&cfg).await.unwrap();
    assert_eq!(scheduler.policy().safe_rpm, 114);
    assert_eq!(scheduler.policy().safe_tpm, 47_500);

    let grant = scheduler.reserve_slot("worker-0", 1_000).await;
    assert!(grant.guaranteed);
    assert!(grant.handle.is_some());
}

#[tokio::test]
async fn test_build_scheduler_rejects_invalid_config() {
    let mut cfg = AppConfig::default();
    cfg.scheduler.headroom = 0.0;
    assert!(build_scheduler(&cfg).await.is_err());
}

#[cfg(not(feature = "redis-store"))]
#[tokio::test]
async fn test_redis_backend_requires_feature() {
    let backend = StoreBackendConfig::Redis {
        url: "redis://127.0.0.1:6379".into(),
    };
    assert!(build_store(&backend, "prefix").await.is_err());
}

#[tokio::test]
async fn test_build_store_in_memory() {
    assert!(build_store(&StoreBackendConfig::InMemory, "prefix").await.is_ok());
}

#[test]
fn test_build_exporter() {
    let exporter = build_exporter(&AppConfig::default()).unwrap();
    assert!(exporter.render().is_ok());
}
