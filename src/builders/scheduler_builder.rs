//! Builders to construct the scheduler stack from configuration.

use std::sync::Arc;

use serde::Serialize;

use crate::config::{AppConfig, StoreBackendConfig};
use crate::core::{
    ExternalCall, PoolError, ReservationScheduler, ReservationStore, SchedulerError,
};
use crate::infra::InMemoryStore;
use crate::metrics::MetricsExporter;
use crate::runtime::WorkerPool;

/// Open the configured store backend.
pub async fn build_store(
    backend: &StoreBackendConfig,
    key_prefix: &str,
) -> Result<Arc<dyn ReservationStore>, SchedulerError> {
    match backend {
        StoreBackendConfig::InMemory => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "redis-store")]
        StoreBackendConfig::Redis { url } => {
            let store = crate::infra::RedisStore::connect(url, key_prefix).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackendConfig::Redis { .. } => {
            let _ = key_prefix;
            Err(SchedulerError::InvalidConfig(
                "redis backend requires the `redis-store` feature".into(),
            ))
        }
    }
}

/// Validate `cfg`, open its store, and create a scheduler over it.
pub async fn build_scheduler(cfg: &AppConfig) -> Result<Arc<ReservationScheduler>, SchedulerError> {
    cfg.validate()
        .map_err(|e| SchedulerError::InvalidConfig(format!("config invalid: {e}")))?;
    let store = build_store(&cfg.store, &cfg.scheduler.key_prefix).await?;
    Ok(Arc::new(ReservationScheduler::new(&cfg.scheduler, store)?))
}

/// Create the metrics exporter.
pub fn build_exporter(cfg: &AppConfig) -> Result<Arc<MetricsExporter>, SchedulerError> {
    Ok(Arc::new(MetricsExporter::new(&cfg.exporter)?))
}

/// Spawn a worker pool running `call` against `scheduler`.
pub fn build_worker_pool<P, T, C>(
    cfg: &AppConfig,
    scheduler: Arc<ReservationScheduler>,
    call: C,
    exporter: Option<Arc<MetricsExporter>>,
) -> Result<WorkerPool<P, T, C>, PoolError>
where
    P: Serialize + Send + Sync + 'static,
    T: Send + 'static,
    C: ExternalCall<P, T>,
{
    WorkerPool::new(&cfg.processor, scheduler, call, exporter)
}
