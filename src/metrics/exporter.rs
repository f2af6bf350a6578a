//! Periodic scheduler snapshots republished as Prometheus metrics.
//!
//! | Name (after the namespace) | Type | Labels |
//! |----------------------------|------|--------|
//! | `rpm_current`, `rpm_safe`, `rpm_max` | IntGauge | |
//! | `rpm_utilization_percent` | Gauge | |
//! | `tpm_current`, `tpm_reserved`, `tpm_window`, `tpm_safe`, `tpm_max` | IntGauge | |
//! | `tpm_utilization_percent` | Gauge | |
//! | `active_requests`, `reservations_total`, `reservations_confirmed` | IntGauge | |
//! | `confirmation_rate_percent`, `reservation_accuracy_ms` | Gauge | |
//! | `bottleneck` | IntGaugeVec | `resource` |
//! | `call_outcomes_total` | IntCounterVec | `outcome` |
//! | `wait_time_seconds` | HistogramVec | `guaranteed` |
//! | `scrape_errors_total` | IntCounter | |
//!
//! The registry belongs to the exporter; render it with
//! [`MetricsExporter::render`].

use std::sync::Arc;

use prometheus::{
    core::Collector, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ExporterConfig;
use crate::core::{Bottleneck, ReservationScheduler, SchedulerError, SchedulerMetrics};

/// Wait-time histogram buckets, in seconds.
const WAIT_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Outcome of one external call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOutcome {
    /// The call succeeded.
    Success,
    /// The call failed for a reason other than a rate limit.
    Error,
    /// The provider rejected the call with a rate limit.
    RateLimit,
}

impl CallOutcome {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::RateLimit => "rate_limit",
        }
    }
}

struct SchedulerGauges {
    rpm_current: IntGauge,
    rpm_safe: IntGauge,
    rpm_max: IntGauge,
    rpm_utilization: Gauge,
    tpm_current: IntGauge,
    tpm_reserved: IntGauge,
    tpm_window: IntGauge,
    tpm_safe: IntGauge,
    tpm_max: IntGauge,
    tpm_utilization: Gauge,
    active_requests: IntGauge,
    reservations_total: IntGauge,
    reservations_confirmed: IntGauge,
    confirmation_rate: Gauge,
    accuracy_ms: Gauge,
    bottleneck: IntGaugeVec,
}

/// Owns the metric registry and the scheduler gauges.
pub struct MetricsExporter {
    config: ExporterConfig,
    registry: Registry,
    gauges: SchedulerGauges,
    call_outcomes: IntCounterVec,
    wait_time: HistogramVec,
    scrape_errors: IntCounter,
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter")
            .field("namespace", &self.config.namespace)
            .field("interval_secs", &self.config.interval_secs)
            .finish_non_exhaustive()
    }
}

fn metrics_err(e: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::Metrics(e.to_string())
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, SchedulerError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| SchedulerError::Metrics(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn set_int(gauge: &IntGauge, value: u64) {
    gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
}

impl MetricsExporter {
    /// Build the registry and every metric.
    pub fn new(config: &ExporterConfig) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        let registry = Registry::new();
        let ns = config.namespace.as_str();

        let int_gauge = |name: &str, help: &str| -> Result<IntGauge, SchedulerError> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(ns)).map_err(metrics_err)?;
            register(&registry, gauge)
        };
        let gauge = |name: &str, help: &str| -> Result<Gauge, SchedulerError> {
            let gauge = Gauge::with_opts(Opts::new(name, help).namespace(ns)).map_err(metrics_err)?;
            register(&registry, gauge)
        };

        let gauges = SchedulerGauges {
            rpm_current: int_gauge("rpm_current", "Reservations in the trailing 60s window")?,
            rpm_safe: int_gauge("rpm_safe", "Request budget after headroom")?,
            rpm_max: int_gauge("rpm_max", "Provider request cap")?,
            rpm_utilization: gauge("rpm_utilization_percent", "Request budget utilization")?,
            tpm_current: int_gauge("tpm_current", "Tokens used in the trailing 60s window")?,
            tpm_reserved: int_gauge("tpm_reserved", "Tokens held by open reservations")?,
            tpm_window: int_gauge("tpm_window", "Used plus reserved tokens")?,
            tpm_safe: int_gauge("tpm_safe", "Token budget after headroom")?,
            tpm_max: int_gauge("tpm_max", "Provider token cap")?,
            tpm_utilization: gauge("tpm_utilization_percent", "Token budget utilization")?,
            active_requests: int_gauge("active_requests", "Calls currently running")?,
            reservations_total: int_gauge("reservations_total", "Reservations granted")?,
            reservations_confirmed: int_gauge("reservations_confirmed", "Reservations whose call started")?,
            confirmation_rate: gauge("confirmation_rate_percent", "Confirmed over granted reservations")?,
            accuracy_ms: gauge("reservation_accuracy_ms", "Mean distance between slot and actual start")?,
            bottleneck: register(
                &registry,
                IntGaugeVec::new(
                    Opts::new("bottleneck", "Budget currently limiting throughput").namespace(ns),
                    &["resource"],
                )
                .map_err(metrics_err)?,
            )?,
        };

        let call_outcomes = register(
            &registry,
            IntCounterVec::new(
                Opts::new("call_outcomes_total", "External call attempts by outcome").namespace(ns),
                &["outcome"],
            )
            .map_err(metrics_err)?,
        )?;
        let wait_time = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("wait_time_seconds", "Wait before each call attempt")
                    .namespace(ns)
                    .buckets(WAIT_BUCKETS.to_vec()),
                &["guaranteed"],
            )
            .map_err(metrics_err)?,
        )?;
        let scrape_errors = register(
            &registry,
            IntCounter::with_opts(
                Opts::new("scrape_errors_total", "Failed scheduler snapshots").namespace(ns),
            )
            .map_err(metrics_err)?,
        )?;

        Ok(Self {
            config: config.clone(),
            registry,
            gauges,
            call_outcomes,
            wait_time,
            scrape_errors,
        })
    }

    /// The registry holding every metric.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Republish a metrics snapshot.
    pub fn publish(&self, m: &SchedulerMetrics) {
        let g = &self.gauges;
        set_int(&g.rpm_current, m.rpm_current);
        set_int(&g.rpm_safe, m.rpm_safe);
        set_int(&g.rpm_max, m.rpm_max);
        g.rpm_utilization.set(m.rpm_utilization_percent);
        set_int(&g.tpm_current, m.tpm_current);
        set_int(&g.tpm_reserved, m.tpm_reserved);
        set_int(&g.tpm_window, m.tpm_window);
        set_int(&g.tpm_safe, m.tpm_safe);
        set_int(&g.tpm_max, m.tpm_max);
        g.tpm_utilization.set(m.tpm_utilization_percent);
        set_int(&g.active_requests, m.active_requests);
        set_int(&g.reservations_total, m.total_reservations);
        set_int(&g.reservations_confirmed, m.confirmed_requests);
        g.confirmation_rate.set(m.confirmation_rate_percent);
        g.accuracy_ms.set(m.average_accuracy_ms);
        for resource in Bottleneck::ALL {
            g.bottleneck
                .with_label_values(&[resource.as_str()])
                .set(i64::from(resource == m.bottleneck));
        }
    }

    /// Pull metrics from `scheduler` and publish them.
    ///
    /// Failures only bump `scrape_errors_total`. Returns whether the scrape
    /// succeeded.
    pub async fn scrape(&self, scheduler: &ReservationScheduler) -> bool {
        match scheduler.get_metrics().await {
            Ok(metrics) => {
                self.publish(&metrics);
                debug!(
                    rpm_utilization = metrics.rpm_utilization_percent,
                    tpm_utilization = metrics.tpm_utilization_percent,
                    bottleneck = metrics.bottleneck.as_str(),
                    "scheduler metrics published"
                );
                true
            }
            Err(e) => {
                self.scrape_errors.inc();
                warn!(error = %e, "scheduler metrics scrape failed");
                false
            }
        }
    }

    /// Count one call attempt.
    pub fn record_outcome(&self, outcome: CallOutcome) {
        self.call_outcomes
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Record a wait, in milliseconds.
    #[allow(clippy::cast_precision_loss)]
    pub fn observe_wait(&self, guaranteed: bool, wait_ms: u64) {
        let label = if guaranteed { "true" } else { "false" };
        self.wait_time
            .with_label_values(&[label])
            .observe(wait_ms as f64 / 1_000.0);
    }

    /// Attempts recorded for `outcome`.
    #[must_use]
    pub fn outcome_count(&self, outcome: CallOutcome) -> u64 {
        self.call_outcomes.with_label_values(&[outcome.as_str()]).get()
    }

    /// Failed scrapes so far.
    #[must_use]
    pub fn scrape_error_count(&self) -> u64 {
        self.scrape_errors.get()
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> Result<String, SchedulerError> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(metrics_err)?;
        String::from_utf8(buf).map_err(metrics_err)
    }

    /// Scrape `scheduler` every configured interval until the handle is stopped.
    pub fn spawn(self: Arc<Self>, scheduler: Arc<ReservationScheduler>) -> ExporterHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let interval = self.config.interval();
        let task = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "metrics exporter started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.scrape(&scheduler).await;
                    }
                }
            }
            info!("metrics exporter stopped");
        });
        ExporterHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Stops a running exporter loop.
#[derive(Debug)]
pub struct ExporterHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ExporterHandle {
    /// Signal the loop and wait for it to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "metrics exporter task ended abnormally");
            }
        }
    }
}

impl Drop for ExporterHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
