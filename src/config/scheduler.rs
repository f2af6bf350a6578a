//! Scheduler budgets, tunables, and store backend selection.

use serde::{Deserialize, Serialize};

/// Store backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum StoreBackendConfig {
    /// In-process store guarded by a mutex; scheduler state is per process.
    #[default]
    InMemory,
    /// Redis store shared across processes (requires the `redis-store` feature).
    Redis {
        /// Connection URL, e.g. `redis://localhost:6379`.
        url: String,
    },
}

/// Provider limits and reservation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Provider hard cap on requests per minute.
    pub max_requests_per_minute: u32,
    /// Provider hard cap on tokens per minute.
    pub max_tokens_per_minute: u64,
    /// Fraction of the provider caps the scheduler may use, in `(0, 1]`.
    pub headroom: f64,
    /// Extra spacing added when a worker already reserved in the current second.
    pub worker_slot_penalty_ms: u64,
    /// Multiplier on the proportional TPM backoff.
    pub tpm_backoff_scale: f64,
    /// Common key prefix for the store collections.
    pub key_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 1_000,
            max_tokens_per_minute: 1_000_000,
            headroom: 0.95,
            worker_slot_penalty_ms: 30,
            tpm_backoff_scale: 1.0,
            key_prefix: "reservation_scheduler".into(),
        }
    }
}

/// Tolerance so that e.g. `1000 × 0.95` floors to 950 rather than 949.
const HEADROOM_EPSILON: f64 = 1e-9;

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn apply_headroom(max: u64, headroom: f64) -> u64 {
    (max as f64 * headroom + HEADROOM_EPSILON).floor().max(0.0) as u64
}

impl SchedulerConfig {
    /// Create a configuration for the given provider caps with default tunables.
    #[must_use]
    pub fn new(max_requests_per_minute: u32, max_tokens_per_minute: u64) -> Self {
        Self {
            max_requests_per_minute,
            max_tokens_per_minute,
            ..Self::default()
        }
    }

    /// Set the headroom fraction.
    #[must_use]
    pub fn with_headroom(mut self, headroom: f64) -> Self {
        self.headroom = headroom;
        self
    }

    /// Set the per-worker fairness penalty.
    #[must_use]
    pub fn with_worker_slot_penalty_ms(mut self, penalty_ms: u64) -> Self {
        self.worker_slot_penalty_ms = penalty_ms;
        self
    }

    /// Set the proportional TPM backoff multiplier.
    #[must_use]
    pub fn with_tpm_backoff_scale(mut self, scale: f64) -> Self {
        self.tpm_backoff_scale = scale;
        self
    }

    /// Set the store key prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// `floor(max_requests_per_minute × headroom)`.
    #[must_use]
    pub fn safe_rpm(&self) -> u64 {
        apply_headroom(u64::from(self.max_requests_per_minute), self.headroom)
    }

    /// `floor(max_tokens_per_minute × headroom)`.
    #[must_use]
    pub fn safe_tpm(&self) -> u64 {
        apply_headroom(self.max_tokens_per_minute, self.headroom)
    }

    /// `max(1, floor(safe_rpm / 60))`.
    #[must_use]
    pub fn safe_requests_per_second(&self) -> u64 {
        (self.safe_rpm() / 60).max(1)
    }

    /// `ceil(1000 / safe_requests_per_second)`.
    #[must_use]
    pub fn min_spacing_ms(&self) -> u64 {
        1_000_u64.div_ceil(self.safe_requests_per_second())
    }

    /// Validate budgets and tunables.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_requests_per_minute == 0 {
            return Err("max_requests_per_minute must be greater than 0".into());
        }
        if self.max_tokens_per_minute == 0 {
            return Err("max_tokens_per_minute must be greater than 0".into());
        }
        if !(self.headroom > 0.0 && self.headroom <= 1.0) {
            return Err(format!("headroom must be in (0, 1], got {}", self.headroom));
        }
        if self.safe_rpm() == 0 {
            return Err("headroom leaves no request budget (safe rpm is 0)".into());
        }
        if self.safe_tpm() == 0 {
            return Err("headroom leaves no token budget (safe tpm is 0)".into());
        }
        if !self.tpm_backoff_scale.is_finite() || self.tpm_backoff_scale < 0.0 {
            return Err("tpm_backoff_scale must be a finite, non-negative number".into());
        }
        if self.key_prefix.is_empty() {
            return Err("key_prefix must not be empty".into());
        }
        Ok(())
    }
}
