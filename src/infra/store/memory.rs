//! In-process reservation store.
//!
//! All state lives behind one [`parking_lot::Mutex`]; every operation,
//! including the plan-and-commit of `reserve`, runs inside a single critical
//! section. Scheduler state is shared by every scheduler in the process that
//! holds the same store, and by nobody else.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::slot::{
    fairness_bucket, in_window, plan_slot, COUNTER_TTL_MS, FAIRNESS_TTL_MS, RESERVATION_TTL_MS,
    TOKEN_TTL_MS,
};
use crate::core::{
    ActiveRequest, MetricsCounters, Reservation, ReservationStore, ReserveOutcome, ReserveRequest,
    SchedulerError, SlotPolicy, TokenHandle, TokenReservation, TokenUsageEntry, WindowSnapshot,
    WindowView, WorkerFairnessEntry,
};

#[derive(Debug, Default)]
struct StoreState {
    /// Sorted by `scheduled_ms`.
    reservations: Vec<Reservation>,
    active: HashMap<String, ActiveRequest>,
    usage: VecDeque<TokenUsageEntry>,
    holds: HashMap<String, TokenReservation>,
    fairness: Vec<WorkerFairnessEntry>,
    counters: MetricsCounters,
    counters_expire_at_ms: Option<u64>,
}

const fn alive(t: u64, ttl: u64, now: u64) -> bool {
    t.saturating_add(ttl) >= now
}

impl StoreState {
    fn prune(&mut self, now: u64) {
        self.reservations
            .retain(|r| alive(r.scheduled_ms, RESERVATION_TTL_MS, now));
        self.active
            .retain(|_, a| alive(a.started_at_ms, RESERVATION_TTL_MS, now));
        self.usage
            .retain(|u| alive(u.timestamp_ms, TOKEN_TTL_MS, now));
        self.holds
            .retain(|_, h| alive(h.scheduled_ms, TOKEN_TTL_MS, now));
        self.fairness
            .retain(|f| alive(f.timestamp_ms, FAIRNESS_TTL_MS, now));
        if self.counters_expire_at_ms.is_some_and(|at| at < now) {
            self.counters = MetricsCounters::default();
            self.counters_expire_at_ms = None;
        }
    }

    fn touch_counters(&mut self, now: u64) {
        self.counters_expire_at_ms = Some(now.saturating_add(COUNTER_TTL_MS));
    }

    fn snapshot(&self, now: u64) -> WindowSnapshot {
        WindowSnapshot {
            now_ms: now,
            rpm_current: self
                .reservations
                .iter()
                .filter(|r| in_window(r.scheduled_ms, now))
                .count() as u64,
            tpm_used: self
                .usage
                .iter()
                .filter(|u| in_window(u.timestamp_ms, now))
                .map(|u| u.token_count)
                .sum(),
            tpm_reserved: self.holds.values().map(|h| h.estimated_tokens).sum(),
            active_requests: self.active.len() as u64,
            counters: self.counters,
        }
    }
}

/// Mutex-guarded store for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduled times of live reservations, ascending.
    #[must_use]
    pub fn reservation_times(&self) -> Vec<u64> {
        self.state
            .lock()
            .reservations
            .iter()
            .map(|r| r.scheduled_ms)
            .collect()
    }

    /// Number of open token holds.
    #[must_use]
    pub fn open_holds(&self) -> usize {
        self.state.lock().holds.len()
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn reserve(
        &self,
        policy: &SlotPolicy,
        request: ReserveRequest,
    ) -> Result<ReserveOutcome, SchedulerError> {
        let now = request.now_ms;
        let mut state = self.state.lock();
        state.prune(now);

        let times: Vec<u64> = state.reservations.iter().map(|r| r.scheduled_ms).collect();
        let tokens: Vec<(u64, u64)> = state
            .usage
            .iter()
            .map(|u| (u.timestamp_ms, u.token_count))
            .chain(state.holds.values().map(|h| (h.scheduled_ms, h.estimated_tokens)))
            .collect();
        let bucket = fairness_bucket(now);
        let worker_in_bucket = state
            .fairness
            .iter()
            .any(|f| f.second_bucket == bucket && f.worker_id == request.worker_id);

        let plan = plan_slot(
            policy,
            WindowView {
                reservations: &times,
                tokens: &tokens,
                worker_in_bucket,
            },
            now,
            request.estimated_tokens,
        );

        let at = state
            .reservations
            .partition_point(|r| r.scheduled_ms <= plan.scheduled_ms);
        state.reservations.insert(
            at,
            Reservation {
                worker_id: request.worker_id.clone(),
                scheduled_ms: plan.scheduled_ms,
                nonce: request.nonce.clone(),
            },
        );
        state.holds.insert(
            request.nonce.clone(),
            TokenReservation {
                scheduled_ms: plan.scheduled_ms,
                estimated_tokens: plan.estimated_tokens,
                nonce: request.nonce.clone(),
            },
        );
        state.fairness.push(WorkerFairnessEntry {
            worker_id: request.worker_id,
            second_bucket: bucket,
            timestamp_ms: now,
        });
        state.counters.total_reservations += 1;
        state.touch_counters(now);

        Ok(ReserveOutcome {
            scheduled_ms: plan.scheduled_ms,
            handle: TokenHandle {
                nonce: request.nonce,
                scheduled_ms: plan.scheduled_ms,
                estimated_tokens: plan.estimated_tokens,
            },
            penalized: plan.penalized,
            snapshot: state.snapshot(now),
        })
    }

    async fn confirm(&self, active: ActiveRequest, accuracy_ms: u64) -> Result<(), SchedulerError> {
        let now = active.started_at_ms;
        let mut state = self.state.lock();
        state.prune(now);
        state.counters.confirmed_requests += 1;
        state.counters.total_accuracy_ms = state.counters.total_accuracy_ms.saturating_add(accuracy_ms);
        state.touch_counters(now);
        state.active.insert(active.id.clone(), active);
        Ok(())
    }

    async fn complete(&self, id: &str, now_ms: u64) -> Result<bool, SchedulerError> {
        let mut state = self.state.lock();
        state.prune(now_ms);
        Ok(state.active.remove(id).is_some())
    }

    async fn record_usage(&self, entry: TokenUsageEntry) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        state.prune(entry.timestamp_ms);
        state.counters.total_usage_tokens = state
            .counters
            .total_usage_tokens
            .saturating_add(entry.token_count);
        state.touch_counters(entry.timestamp_ms);
        state.usage.push_back(entry);
        Ok(())
    }

    async fn release_tokens(&self, handle: &TokenHandle, now_ms: u64) -> Result<bool, SchedulerError> {
        let mut state = self.state.lock();
        state.prune(now_ms);
        Ok(state.holds.remove(&handle.nonce).is_some())
    }

    async fn snapshot(&self, now_ms: u64) -> Result<WindowSnapshot, SchedulerError> {
        let mut state = self.state.lock();
        state.prune(now_ms);
        Ok(state.snapshot(now_ms))
    }

    async fn reset(&self) -> Result<(), SchedulerError> {
        *self.state.lock() = StoreState::default();
        Ok(())
    }
}
