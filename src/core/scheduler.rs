//! Reservation scheduler: grants future time slots against the shared store.
//!
//! The scheduler owns no mutable state of its own. Every call goes through the
//! [`ReservationStore`], so any number of scheduler instances (in one process
//! or many) can share a budget as long as they share a store.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::util::{Clock, SystemClock};

use super::store::{
    ActiveRequest, ReservationStore, ReserveRequest, TokenHandle, TokenUsageEntry, WindowSnapshot,
};
use super::{SchedulerError, SlotPolicy};

/// Utilization above which a budget is reported as the bottleneck.
pub const BOTTLENECK_THRESHOLD_PERCENT: f64 = 80.0;

/// Bounds of the randomized wait handed out when the store is unreachable.
pub const FALLBACK_WAIT_MS: std::ops::Range<u64> = 1_000..2_000;

/// Which budget currently limits throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bottleneck {
    /// Requests per minute.
    Rpm,
    /// Tokens per minute.
    Tpm,
    /// Neither budget is above the threshold.
    None,
}

impl Bottleneck {
    /// All variants, in label order.
    pub const ALL: [Self; 3] = [Self::Rpm, Self::Tpm, Self::None];

    /// Classify from utilization percentages. RPM wins ties.
    #[must_use]
    pub fn classify(rpm_utilization_percent: f64, tpm_utilization_percent: f64) -> Self {
        if rpm_utilization_percent > BOTTLENECK_THRESHOLD_PERCENT
            && rpm_utilization_percent >= tpm_utilization_percent
        {
            Self::Rpm
        } else if tpm_utilization_percent > BOTTLENECK_THRESHOLD_PERCENT {
            Self::Tpm
        } else {
            Self::None
        }
    }

    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rpm => "rpm",
            Self::Tpm => "tpm",
            Self::None => "none",
        }
    }
}

/// Utilization attached to every grant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSnapshot {
    /// Reservations in the trailing window.
    pub rpm_current: u64,
    /// Request budget.
    pub rpm_safe: u64,
    /// `rpm_current / rpm_safe` in percent.
    pub rpm_utilization_percent: f64,
    /// Usage plus open holds.
    pub tpm_window: u64,
    /// Token budget.
    pub tpm_safe: u64,
    /// `tpm_window / tpm_safe` in percent.
    pub tpm_utilization_percent: f64,
}

/// Full scheduler metrics, as published by the exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    /// Reservations in the trailing window.
    pub rpm_current: u64,
    /// Request budget after headroom.
    pub rpm_safe: u64,
    /// Provider request cap.
    pub rpm_max: u64,
    /// `rpm_current / rpm_safe` in percent.
    pub rpm_utilization_percent: f64,
    /// Usage recorded in the trailing window.
    pub tpm_current: u64,
    /// Open token holds.
    pub tpm_reserved: u64,
    /// `tpm_current + tpm_reserved`.
    pub tpm_window: u64,
    /// Token budget after headroom.
    pub tpm_safe: u64,
    /// Provider token cap.
    pub tpm_max: u64,
    /// `tpm_window / tpm_safe` in percent.
    pub tpm_utilization_percent: f64,
    /// Calls currently running.
    pub active_requests: u64,
    /// Reservations granted.
    pub total_reservations: u64,
    /// Reservations whose call started.
    pub confirmed_requests: u64,
    /// `confirmed / total` in percent.
    pub confirmation_rate_percent: f64,
    /// Mean `|start - scheduled|` over confirmed requests.
    pub average_accuracy_ms: f64,
    /// Usage recorded since the counters were last reset.
    pub total_usage_tokens: u64,
    /// Limiting budget.
    pub bottleneck: Bottleneck,
}

/// Answer to [`ReservationScheduler::reserve_slot`].
#[derive(Debug, Clone, PartialEq)]
pub struct SlotGrant {
    /// Start time the caller must wait for.
    pub scheduled_ms: u64,
    /// `max(0, scheduled - now)`.
    pub wait_ms: u64,
    /// `false` when the store was unreachable and the wait is a fallback.
    pub guaranteed: bool,
    /// Utilization at grant time.
    pub metrics: UtilizationSnapshot,
    /// Token hold to finalize. `None` for fallback grants.
    pub handle: Option<TokenHandle>,
}

impl SlotGrant {
    /// Wait as a [`Duration`].
    #[must_use]
    pub const fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// A call that started, returned by [`ReservationScheduler::confirm_reservation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTicket {
    /// Active request id.
    pub id: String,
    /// Worker running the call.
    pub worker_id: String,
    /// Slot the call was granted.
    pub scheduled_ms: u64,
    /// Actual start.
    pub started_at_ms: u64,
    /// `|started - scheduled|`.
    pub accuracy_ms: u64,
}

#[allow(clippy::cast_precision_loss)]
fn percent(value: u64, of: u64) -> f64 {
    if of == 0 {
        0.0
    } else {
        value as f64 / of as f64 * 100.0
    }
}

/// Grants slots against a shared [`ReservationStore`].
#[derive(Debug, Clone)]
pub struct ReservationScheduler {
    config: SchedulerConfig,
    policy: SlotPolicy,
    store: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
}

impl ReservationScheduler {
    /// Create a scheduler over `store`, using the system clock.
    pub fn new(config: &SchedulerConfig, store: Arc<dyn ReservationStore>) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        Ok(Self {
            config: config.clone(),
            policy: SlotPolicy::from_config(config),
            store,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Derived planner parameters.
    #[must_use]
    pub const fn policy(&self) -> &SlotPolicy {
        &self.policy
    }

    /// Current time according to the scheduler's clock.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Reserve the earliest slot that fits both budgets.
    ///
    /// Never fails: when the store is unreachable the grant is a randomized
    /// fallback wait with `guaranteed = false` and no token handle.
    pub async fn reserve_slot(&self, worker_id: &str, estimated_tokens: u64) -> SlotGrant {
        let requested = estimated_tokens.max(1);
        let estimate = self.policy.clamp_estimate(requested);
        if estimate < requested {
            warn!(
                worker_id,
                requested,
                safe_tpm = self.policy.safe_tpm,
                "estimate exceeds token budget; clamping"
            );
        }

        let now = self.clock.now_ms();
        let request = ReserveRequest {
            worker_id: worker_id.to_string(),
            estimated_tokens: estimate,
            nonce: Uuid::new_v4().to_string(),
            now_ms: now,
        };

        match self.store.reserve(&self.policy, request).await {
            Ok(outcome) => {
                let wait_ms = outcome.scheduled_ms.saturating_sub(now);
                debug!(
                    worker_id,
                    scheduled_ms = outcome.scheduled_ms,
                    wait_ms,
                    estimate,
                    penalized = outcome.penalized,
                    "slot reserved"
                );
                SlotGrant {
                    scheduled_ms: outcome.scheduled_ms,
                    wait_ms,
                    guaranteed: true,
                    metrics: self.utilization(&outcome.snapshot),
                    handle: Some(outcome.handle),
                }
            }
            Err(e) => {
                let wait_ms = rand::rng().random_range(FALLBACK_WAIT_MS);
                warn!(worker_id, wait_ms, error = %e, "store unavailable; using fallback wait");
                SlotGrant {
                    scheduled_ms: now + wait_ms,
                    wait_ms,
                    guaranteed: false,
                    metrics: UtilizationSnapshot {
                        rpm_safe: self.policy.safe_rpm,
                        tpm_safe: self.policy.safe_tpm,
                        ..UtilizationSnapshot::default()
                    },
                    handle: None,
                }
            }
        }
    }

    /// Mark the call for a slot as started. Best-effort.
    pub async fn confirm_reservation(&self, worker_id: &str, scheduled_ms: u64) -> ActiveTicket {
        let now = self.clock.now_ms();
        let ticket = ActiveTicket {
            id: Uuid::new_v4().to_string(),
            worker_id: worker_id.to_string(),
            scheduled_ms,
            started_at_ms: now,
            accuracy_ms: now.abs_diff(scheduled_ms),
        };
        let active = ActiveRequest {
            id: ticket.id.clone(),
            worker_id: ticket.worker_id.clone(),
            started_at_ms: now,
        };
        if let Err(e) = self.store.confirm(active, ticket.accuracy_ms).await {
            error!(worker_id, error = %e, "failed to confirm reservation");
        }
        ticket
    }

    /// Remove the active request of a finished call. Best-effort.
    pub async fn complete_request(&self, ticket: &ActiveTicket) {
        let now = self.clock.now_ms();
        if let Err(e) = self.store.complete(&ticket.id, now).await {
            error!(worker_id = %ticket.worker_id, error = %e, "failed to complete request");
        }
    }

    /// Append real usage at the current time. Best-effort.
    pub async fn record_token_usage(&self, input_tokens: u64, output_tokens: u64) {
        let entry = TokenUsageEntry {
            timestamp_ms: self.clock.now_ms(),
            token_count: input_tokens.saturating_add(output_tokens),
        };
        if let Err(e) = self.store.record_usage(entry).await {
            error!(tokens = entry.token_count, error = %e, "failed to record token usage");
        }
    }

    /// Release a token hold. Returns `false` if it was already gone.
    pub async fn finalize_token_reservation(&self, handle: &TokenHandle) -> bool {
        let now = self.clock.now_ms();
        match self.store.release_tokens(handle, now).await {
            Ok(removed) => removed,
            Err(e) => {
                error!(nonce = %handle.nonce, error = %e, "failed to finalize token reservation");
                false
            }
        }
    }

    /// Current metrics.
    pub async fn get_metrics(&self) -> Result<SchedulerMetrics, SchedulerError> {
        let snapshot = self.store.snapshot(self.clock.now_ms()).await?;
        Ok(self.metrics_from(&snapshot))
    }

    /// Clear all shared state.
    pub async fn reset(&self) -> Result<(), SchedulerError> {
        self.store.reset().await
    }

    fn utilization(&self, snapshot: &WindowSnapshot) -> UtilizationSnapshot {
        let tpm_window = snapshot.tpm_used.saturating_add(snapshot.tpm_reserved);
        UtilizationSnapshot {
            rpm_current: snapshot.rpm_current,
            rpm_safe: self.policy.safe_rpm,
            rpm_utilization_percent: percent(snapshot.rpm_current, self.policy.safe_rpm),
            tpm_window,
            tpm_safe: self.policy.safe_tpm,
            tpm_utilization_percent: percent(tpm_window, self.policy.safe_tpm),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn metrics_from(&self, snapshot: &WindowSnapshot) -> SchedulerMetrics {
        let util = self.utilization(snapshot);
        let counters = snapshot.counters;
        let average_accuracy_ms = if counters.confirmed_requests == 0 {
            0.0
        } else {
            counters.total_accuracy_ms as f64 / counters.confirmed_requests as f64
        };
        SchedulerMetrics {
            rpm_current: util.rpm_current,
            rpm_safe: util.rpm_safe,
            rpm_max: u64::from(self.config.max_requests_per_minute),
            rpm_utilization_percent: util.rpm_utilization_percent,
            tpm_current: snapshot.tpm_used,
            tpm_reserved: snapshot.tpm_reserved,
            tpm_window: util.tpm_window,
            tpm_safe: util.tpm_safe,
            tpm_max: self.config.max_tokens_per_minute,
            tpm_utilization_percent: util.tpm_utilization_percent,
            active_requests: snapshot.active_requests,
            total_reservations: counters.total_reservations,
            confirmed_requests: counters.confirmed_requests,
            confirmation_rate_percent: percent(counters.confirmed_requests, counters.total_reservations),
            average_accuracy_ms,
            total_usage_tokens: counters.total_usage_tokens,
            bottleneck: Bottleneck::classify(util.rpm_utilization_percent, util.tpm_utilization_percent),
        }
    }
}
