//! # Reservation Scheduler
//!
//! Distributed admission control for quota-limited external APIs.
//!
//! Providers cap callers on two independent budgets: requests per minute (RPM)
//! and tokens per minute (TPM). This crate lets many concurrent workers share
//! those budgets without ever exceeding them, by handing out future time slots
//! from a shared reservation timeline instead of reacting to rejections.
//!
//! ## Components
//!
//! - **Reservation Store** ([`core::ReservationStore`]): shared windows of
//!   reservations, token usage, token holds, worker fairness, and counters.
//!   [`infra::InMemoryStore`] for one process, `infra::RedisStore` (feature
//!   `redis-store`) across processes.
//! - **Reservation Scheduler** ([`core::ReservationScheduler`]): plans and
//!   commits slots in one atomic step, degrading to a randomized wait when
//!   the store is unreachable.
//! - **Request Processor** ([`core::RequestProcessor`]): per-worker state
//!   machine that estimates, reserves, waits, calls, and records usage.
//! - **Metrics Exporter** ([`metrics::MetricsExporter`]): Prometheus gauges,
//!   outcome counters, and a wait-time histogram.
//! - **Worker Pool** ([`runtime::WorkerPool`]): runs processors concurrently.
//!
//! ```rust,ignore
//! use reservation_scheduler::builders::{build_exporter, build_scheduler, build_worker_pool};
//! use reservation_scheduler::config::AppConfig;
//!
//! let cfg = AppConfig::from_env()?;
//! let scheduler = build_scheduler(&cfg).await?;
//! let exporter = build_exporter(&cfg)?;
//! let _metrics = exporter.clone().spawn(scheduler.clone());
//! let pool = build_worker_pool(&cfg, scheduler, my_call, Some(exporter))?;
//!
//! let result = pool.submit_unit(payload).await?;
//! println!("waited {}ms", result.wait_time_ms);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions: store contract, planner, scheduler, processor.
pub mod core;
/// Configuration models for the scheduler, processors, exporter, and store.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Reservation store backends.
pub mod infra;
/// Prometheus metrics surface.
pub mod metrics;
/// Tokio runtime adapters.
pub mod runtime;
/// Shared utilities.
pub mod util;
