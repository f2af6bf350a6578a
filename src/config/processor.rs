//! Request-processor, worker-pool, and exporter configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Policy for retrying a unit after the provider rejected it with a rate limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of rate-limit retries per unit. `None` retries forever.
    pub max_rate_limit_retries: Option<u32>,
}

impl RetryPolicy {
    /// Retry every rate-limit rejection.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            max_rate_limit_retries: None,
        }
    }

    /// Give up after `retries` rate-limit retries.
    #[must_use]
    pub const fn bounded(retries: u32) -> Self {
        Self {
            max_rate_limit_retries: Some(retries),
        }
    }

    /// Whether another attempt is allowed after `attempts` attempts were rate limited.
    #[must_use]
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_rate_limit_retries.is_none_or(|max| attempts <= max)
    }
}

/// Cooperative backpressure thresholds derived from recent TPM utilization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Utilization samples required before any throttling is suggested.
    pub min_samples: usize,
    /// Soft limit on the average utilization, in percent.
    pub average_threshold_percent: f64,
    /// Soft limit on the most recent utilization, in percent.
    pub peak_threshold_percent: f64,
    /// Delay suggested per percentage point above the threshold.
    pub ms_per_excess_percent: f64,
    /// Lower clamp for a non-zero delay.
    pub min_delay_ms: u64,
    /// Upper clamp for any delay.
    pub max_delay_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_samples: 3,
            average_threshold_percent: 85.0,
            peak_threshold_percent: 95.0,
            ms_per_excess_percent: 1_000.0,
            min_delay_ms: 1_000,
            max_delay_ms: 20_000,
        }
    }
}

/// Per-worker request processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Number of concurrent workers in the pool.
    pub worker_count: usize,
    /// Maximum units waiting for a free worker before submissions are rejected.
    pub queue_depth: usize,
    /// Output tokens assumed for every call.
    pub expected_output_tokens: u64,
    /// Fixed prompt overhead (cached instructions, system prompt).
    pub instruction_overhead_tokens: u64,
    /// Absolute upper bound on any estimate.
    pub hard_token_ceiling: u64,
    /// Added to the largest observed usage to form the adaptive ceiling.
    pub ceiling_buffer_tokens: u64,
    /// Completed calls kept in the rolling estimation windows.
    pub sample_window: usize,
    /// Characters per token for the length heuristic.
    pub chars_per_token: f64,
    /// Upper bound of the random jitter added to every wait.
    pub max_jitter_ms: u64,
    /// Backpressure thresholds.
    pub throttle: ThrottleConfig,
    /// Rate-limit retry policy.
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            queue_depth: 1_024,
            expected_output_tokens: 1_000,
            instruction_overhead_tokens: 1_500,
            hard_token_ceiling: 32_000,
            ceiling_buffer_tokens: 2_000,
            sample_window: 10,
            chars_per_token: 4.0,
            max_jitter_ms: 500,
            throttle: ThrottleConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the submission queue depth.
    #[must_use]
    pub const fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the expected output tokens per call.
    #[must_use]
    pub const fn with_expected_output_tokens(mut self, tokens: u64) -> Self {
        self.expected_output_tokens = tokens;
        self
    }

    /// Set the fixed instruction overhead.
    #[must_use]
    pub const fn with_instruction_overhead_tokens(mut self, tokens: u64) -> Self {
        self.instruction_overhead_tokens = tokens;
        self
    }

    /// Set the hard estimate ceiling.
    #[must_use]
    pub const fn with_hard_token_ceiling(mut self, tokens: u64) -> Self {
        self.hard_token_ceiling = tokens;
        self
    }

    /// Set the maximum wait jitter.
    #[must_use]
    pub const fn with_max_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.max_jitter_ms = jitter_ms;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Lowest estimate ever produced: overhead plus expected output.
    #[must_use]
    pub const fn estimate_floor(&self) -> u64 {
        self.instruction_overhead_tokens
            .saturating_add(self.expected_output_tokens)
    }

    /// Validate processor settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.queue_depth == 0 {
            return Err("queue_depth must be greater than 0".into());
        }
        if self.sample_window == 0 {
            return Err("sample_window must be greater than 0".into());
        }
        if !(self.chars_per_token.is_finite() && self.chars_per_token > 0.0) {
            return Err("chars_per_token must be a positive number".into());
        }
        if self.hard_token_ceiling < self.estimate_floor().max(1) {
            return Err(format!(
                "hard_token_ceiling ({}) must be at least overhead + expected output ({})",
                self.hard_token_ceiling,
                self.estimate_floor()
            ));
        }
        let t = &self.throttle;
        if t.min_delay_ms > t.max_delay_ms {
            return Err("throttle.min_delay_ms must not exceed throttle.max_delay_ms".into());
        }
        for (name, value) in [
            ("average_threshold_percent", t.average_threshold_percent),
            ("peak_threshold_percent", t.peak_threshold_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(format!("throttle.{name} must be within 0..=100"));
            }
        }
        if !(t.ms_per_excess_percent.is_finite() && t.ms_per_excess_percent >= 0.0) {
            return Err("throttle.ms_per_excess_percent must be non-negative".into());
        }
        Ok(())
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Seconds between scheduler snapshots.
    pub interval_secs: u64,
    /// Prometheus namespace prepended to every metric name.
    pub namespace: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            namespace: "reservation_scheduler".into(),
        }
    }
}

impl ExporterConfig {
    /// Snapshot interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Validate exporter settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("interval_secs must be greater than 0".into());
        }
        let valid_start = self
            .namespace
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_start
            || !self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(format!("namespace `{}` is not a valid metric prefix", self.namespace));
        }
        Ok(())
    }
}
