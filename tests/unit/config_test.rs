//! Tests for configuration validation

use reservation_scheduler::config::{
    AppConfig, ExporterConfig, ProcessorConfig, RetryPolicy, SchedulerConfig, StoreBackendConfig,
};

#[test]
fn test_scheduler_config_defaults() {
    let cfg = SchedulerConfig::default();
    assert_eq!(cfg.max_requests_per_minute, 1_000);
    assert!((cfg.headroom - 0.95).abs() < f64::EPSILON);
    assert_eq!(cfg.worker_slot_penalty_ms, 30);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_scheduler_config_invalid_limits() {
    assert!(SchedulerConfig::new(0, 1_000).validate().is_err());
    assert!(SchedulerConfig::new(60, 0).validate().is_err());
}

#[test]
fn test_scheduler_config_invalid_key_prefix() {
    let cfg = SchedulerConfig::new(60, 1_000).with_key_prefix("");
    assert!(cfg.validate().is_err());
}

#[test]
fn test_processor_config_invalid_worker_count() {
    let cfg = ProcessorConfig::new().with_worker_count(0);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_processor_config_invalid_queue_depth() {
    let cfg = ProcessorConfig::new().with_queue_depth(0);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_processor_config_defaults() {
    let cfg = ProcessorConfig::default();
    assert!(cfg.worker_count >= 1);
    assert_eq!(cfg.estimate_floor(), 2_500);
    assert_eq!(cfg.retry, RetryPolicy::unbounded());
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_exporter_config_invalid_interval() {
    let cfg = ExporterConfig {
        interval_secs: 0,
        ..ExporterConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_app_config_from_json() {
    let json = r#"{
        "scheduler": { "max_requests_per_minute": 500, "max_tokens_per_minute": 200000, "headroom": 0.9 },
        "processor": { "worker_count": 8, "retry": { "max_rate_limit_retries": 5 } },
        "exporter": { "interval_secs": 30 },
        "store": { "backend": "redis", "url": "redis://127.0.0.1:6379" }
    }"#;
    let cfg = AppConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.scheduler.safe_rpm(), 450);
    assert_eq!(cfg.scheduler.safe_tpm(), 180_000);
    assert_eq!(cfg.processor.worker_count, 8);
    assert_eq!(cfg.processor.retry, RetryPolicy::bounded(5));
    assert_eq!(cfg.processor.expected_output_tokens, 1_000);
    assert_eq!(cfg.exporter.interval_secs, 30);
    assert_eq!(
        cfg.store,
        StoreBackendConfig::Redis {
            url: "redis://127.0.0.1:6379".into()
        }
    );
}

#[test]
fn test_app_config_defaults_to_in_memory() {
    let cfg = AppConfig::from_json_str("{}").unwrap();
    assert_eq!(cfg.store, StoreBackendConfig::InMemory);
}

#[test]
fn test_app_config_rejects_invalid_headroom() {
    let err = AppConfig::from_json_str(r#"{"scheduler": {"headroom": 1.5}}"#).unwrap_err();
    assert!(err.contains("headroom"));
}

#[test]
fn test_app_config_rejects_malformed_json() {
    let err = AppConfig::from_json_str("{ not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}
