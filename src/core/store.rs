//! Reservation store contract and the records it holds.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{SchedulerError, SlotPolicy};

/// A granted time slot on the shared timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Worker that owns the slot.
    pub worker_id: String,
    /// Granted start time.
    pub scheduled_ms: u64,
    /// Unique id shared with the matching token hold.
    pub nonce: String,
}

/// A call that has started. Observability only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRequest {
    /// Ticket id.
    pub id: String,
    /// Worker running the call.
    pub worker_id: String,
    /// Actual start time.
    pub started_at_ms: u64,
}

/// Real token usage of a completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageEntry {
    /// Completion time.
    pub timestamp_ms: u64,
    /// Input plus output tokens.
    pub token_count: u64,
}

/// Provisional hold on the token budget, released once usage is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenReservation {
    /// Slot the hold belongs to.
    pub scheduled_ms: u64,
    /// Held tokens.
    pub estimated_tokens: u64,
    /// Reservation nonce.
    pub nonce: String,
}

/// One reservation made by a worker within a one-second bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFairnessEntry {
    /// Worker id.
    pub worker_id: String,
    /// `timestamp_ms / 1000`.
    pub second_bucket: u64,
    /// Time the reservation was made.
    pub timestamp_ms: u64,
}

/// Monotonic counters, reset after an hour without updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsCounters {
    /// Reservations granted by the store.
    pub total_reservations: u64,
    /// Reservations whose call actually started.
    pub confirmed_requests: u64,
    /// Sum of `|start - scheduled|` over confirmed requests.
    pub total_accuracy_ms: u64,
    /// Sum of recorded usage.
    pub total_usage_tokens: u64,
}

/// Identifies the token hold created with a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenHandle {
    /// Reservation nonce.
    pub nonce: String,
    /// Slot the hold belongs to.
    pub scheduled_ms: u64,
    /// Held tokens.
    pub estimated_tokens: u64,
}

/// Input of [`ReservationStore::reserve`].
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// Requesting worker.
    pub worker_id: String,
    /// Estimate, already coerced to at least 1.
    pub estimated_tokens: u64,
    /// Fresh nonce for the reservation and its hold.
    pub nonce: String,
    /// Current time.
    pub now_ms: u64,
}

/// Point-in-time view of the windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    /// Time of the snapshot.
    pub now_ms: u64,
    /// Reservations in `(now - 60s, now]`.
    pub rpm_current: u64,
    /// Usage recorded in `(now - 60s, now]`.
    pub tpm_used: u64,
    /// Open holds that have not aged out, including future ones.
    pub tpm_reserved: u64,
    /// Active requests.
    pub active_requests: u64,
    /// Counters.
    pub counters: MetricsCounters,
}

/// Result of a committed reservation.
#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    /// Granted start time.
    pub scheduled_ms: u64,
    /// Handle of the token hold.
    pub handle: TokenHandle,
    /// Whether the fairness penalty was applied.
    pub penalized: bool,
    /// Windows right after the commit.
    pub snapshot: WindowSnapshot,
}

/// Shared scheduler state.
///
/// `reserve` is the one read-compute-write transaction and must be atomic
/// with respect to every other caller. The remaining operations are atomic
/// individually. Every operation prunes expired entries relative to the
/// supplied time.
#[async_trait]
pub trait ReservationStore: Send + Sync + fmt::Debug {
    /// Plan and commit a reservation plus its token hold.
    async fn reserve(
        &self,
        policy: &SlotPolicy,
        request: ReserveRequest,
    ) -> Result<ReserveOutcome, SchedulerError>;

    /// Record that a call started.
    async fn confirm(&self, active: ActiveRequest, accuracy_ms: u64) -> Result<(), SchedulerError>;

    /// Remove an active request. Returns whether it was present.
    async fn complete(&self, id: &str, now_ms: u64) -> Result<bool, SchedulerError>;

    /// Append real usage.
    async fn record_usage(&self, entry: TokenUsageEntry) -> Result<(), SchedulerError>;

    /// Remove a token hold. Returns whether it was present.
    async fn release_tokens(&self, handle: &TokenHandle, now_ms: u64) -> Result<bool, SchedulerError>;

    /// Snapshot the windows.
    async fn snapshot(&self, now_ms: u64) -> Result<WindowSnapshot, SchedulerError>;

    /// Drop all state.
    async fn reset(&self) -> Result<(), SchedulerError>;
}
