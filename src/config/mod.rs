//! Configuration models for the scheduler, processors, exporter, and store.

pub mod app;
pub mod processor;
pub mod scheduler;

pub use app::AppConfig;
pub use processor::{ExporterConfig, ProcessorConfig, RetryPolicy, ThrottleConfig};
pub use scheduler::{SchedulerConfig, StoreBackendConfig};
