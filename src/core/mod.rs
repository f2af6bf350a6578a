//! Core scheduling abstractions: the store contract, slot planning, the
//! reservation scheduler, and the per-worker request processor.

pub mod error;
pub mod estimator;
pub mod executor;
pub mod processor;
pub mod scheduler;
pub mod slot;
pub mod store;

pub use error::{EstimationError, PoolError, ProcessError, SchedulerError};
pub use estimator::{TokenEstimate, TokenEstimator};
pub use executor::{CallError, CallResponse, ExternalCall, TokenUsage};
pub use processor::{RequestProcessor, UnitResult};
pub use scheduler::{
    ActiveTicket, Bottleneck, ReservationScheduler, SchedulerMetrics, SlotGrant,
    UtilizationSnapshot,
};
pub use slot::{plan_slot, SlotPlan, SlotPolicy, WindowView};
pub use store::{
    ActiveRequest, MetricsCounters, Reservation, ReservationStore, ReserveOutcome, ReserveRequest,
    TokenHandle, TokenReservation, TokenUsageEntry, WindowSnapshot, WorkerFairnessEntry,
};
