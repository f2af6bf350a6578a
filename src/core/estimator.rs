//! Adaptive token estimation and cooperative backpressure.
//!
//! Each request processor owns one [`TokenEstimator`]. It keeps short rolling
//! windows of observed usage and TPM utilization; nothing is shared between
//! workers.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::warn;

use crate::config::{ProcessorConfig, ThrottleConfig};

use super::{EstimationError, TokenUsage};

/// An estimate together with the values it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenEstimate {
    /// Estimate to reserve.
    pub tokens: u64,
    /// Length heuristic (overhead only when the payload size was unknown).
    pub heuristic: u64,
    /// Mean of recent actual totals, if any were recorded.
    pub moving_average: Option<u64>,
    /// Lower clamp.
    pub floor: u64,
    /// Upper clamp.
    pub ceiling: u64,
}

/// Rolling-window token estimator.
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    chars_per_token: f64,
    instruction_overhead: u64,
    expected_output: u64,
    hard_ceiling: u64,
    ceiling_buffer: u64,
    window: usize,
    throttle: ThrottleConfig,
    prompt_tokens: VecDeque<u64>,
    output_tokens: VecDeque<u64>,
    total_tokens: VecDeque<u64>,
    utilization: VecDeque<f64>,
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

impl TokenEstimator {
    /// Create an estimator with empty windows.
    #[must_use]
    pub fn new(config: &ProcessorConfig) -> Self {
        let window = config.sample_window.max(1);
        Self {
            chars_per_token: config.chars_per_token,
            instruction_overhead: config.instruction_overhead_tokens,
            expected_output: config.expected_output_tokens,
            hard_ceiling: config.hard_token_ceiling.max(config.estimate_floor()),
            ceiling_buffer: config.ceiling_buffer_tokens,
            window,
            throttle: config.throttle.clone(),
            prompt_tokens: VecDeque::with_capacity(window),
            output_tokens: VecDeque::with_capacity(window),
            total_tokens: VecDeque::with_capacity(window),
            utilization: VecDeque::with_capacity(window),
        }
    }

    /// `overhead + expected_output`.
    #[must_use]
    pub const fn floor(&self) -> u64 {
        self.instruction_overhead.saturating_add(self.expected_output)
    }

    /// Largest recent total plus buffer, bounded by the hard ceiling.
    #[must_use]
    pub fn ceiling(&self) -> u64 {
        self.total_tokens.iter().max().map_or(self.hard_ceiling, |&max| {
            self.hard_ceiling
                .min(self.floor().max(max.saturating_add(self.ceiling_buffer)))
        })
    }

    /// Mean of the recent actual totals.
    #[must_use]
    pub fn moving_average(&self) -> Option<u64> {
        if self.total_tokens.is_empty() {
            return None;
        }
        let sum: u64 = self.total_tokens.iter().sum();
        Some(sum.div_ceil(self.total_tokens.len() as u64))
    }

    /// Estimate the cost of a payload of `prompt_chars` characters.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn estimate(&self, prompt_chars: Result<usize, EstimationError>) -> TokenEstimate {
        let heuristic = match prompt_chars {
            Ok(chars) => {
                let prompt = (chars as f64 / self.chars_per_token).ceil();
                let prompt = if prompt.is_finite() { prompt.min(u64::MAX as f64) as u64 } else { u64::MAX };
                prompt
                    .saturating_add(self.instruction_overhead)
                    .saturating_add(self.expected_output)
            }
            Err(e) => {
                warn!(error = %e, "falling back to instruction overhead for estimate");
                self.instruction_overhead
            }
        };
        let moving_average = self.moving_average();
        let floor = self.floor();
        let ceiling = self.ceiling();
        let raw = moving_average.map_or(heuristic, |avg| heuristic.max(avg));
        TokenEstimate {
            tokens: raw.clamp(floor, ceiling),
            heuristic,
            moving_average,
            floor,
            ceiling,
        }
    }

    /// Feed the actual usage of a completed call.
    pub fn record_usage(&mut self, usage: TokenUsage) {
        push_bounded(&mut self.prompt_tokens, usage.input_tokens, self.window);
        push_bounded(&mut self.output_tokens, usage.output_tokens, self.window);
        push_bounded(&mut self.total_tokens, usage.total(), self.window);
    }

    /// Feed a TPM utilization sample, in percent.
    pub fn record_utilization(&mut self, percent: f64) {
        if percent.is_finite() {
            push_bounded(&mut self.utilization, percent, self.window);
        }
    }

    /// Mean of the recent prompt sizes, in tokens.
    #[must_use]
    pub fn average_prompt_tokens(&self) -> Option<u64> {
        let n = self.prompt_tokens.len() as u64;
        (n > 0).then(|| self.prompt_tokens.iter().sum::<u64>() / n)
    }

    /// Mean of the recent completion sizes, in tokens.
    #[must_use]
    pub fn average_output_tokens(&self) -> Option<u64> {
        let n = self.output_tokens.len() as u64;
        (n > 0).then(|| self.output_tokens.iter().sum::<u64>() / n)
    }

    /// Number of usage samples held.
    #[must_use]
    pub fn samples(&self) -> usize {
        self.total_tokens.len()
    }

    /// Suggested extra delay before the next dispatch, or 0.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    #[must_use]
    pub fn throttle_delay_ms(&self) -> u64 {
        let t = &self.throttle;
        if self.utilization.len() < t.min_samples.max(1) {
            return 0;
        }
        let average = self.utilization.iter().sum::<f64>() / self.utilization.len() as f64;
        let latest = self.utilization.back().copied().unwrap_or(0.0);
        let excess = (average - t.average_threshold_percent).max(latest - t.peak_threshold_percent);
        if excess <= 0.0 {
            return 0;
        }
        let delay = (excess * t.ms_per_excess_percent).ceil() as u64;
        delay.clamp(t.min_delay_ms, t.max_delay_ms)
    }

    /// Drop every sample.
    pub fn reset(&mut self) {
        self.prompt_tokens.clear();
        self.output_tokens.clear();
        self.total_tokens.clear();
        self.utilization.clear();
    }
}
