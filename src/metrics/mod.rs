//! Prometheus metrics surface.

pub mod exporter;

pub use exporter::{CallOutcome, ExporterHandle, MetricsExporter};
