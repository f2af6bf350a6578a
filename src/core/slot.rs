//! Slot planning for the reservation timeline.
//!
//! [`plan_slot`] is the pure read-compute half of `reserve_slot`: given a view
//! of the shared windows it finds the earliest start time that keeps every
//! trailing 60-second window within the request and token budgets. Stores run it inside
//! their atomic section (the Redis store runs an equivalent Lua script).
//!
//! Guards, re-evaluated until none of them moves the candidate:
//!
//! * **spacing**: no two reservations closer than `min_spacing_ms`;
//! * **rpm**: the window ending at the candidate, and every later window that
//!   would contain it, holds fewer than `safe_rpm` reservations;
//! * **tpm**: usage plus open holds in the window ending at the candidate,
//!   and in every later window that would contain it, plus the estimate, fit
//!   in `safe_tpm`;
//! * **fairness**: a worker that already reserved in the current second pays
//!   `worker_slot_penalty_ms` once.

use crate::config::SchedulerConfig;

/// Length of the trailing budget windows.
pub const WINDOW_MS: u64 = 60_000;
/// Retention of reservations and active requests.
pub const RESERVATION_TTL_MS: u64 = 120_000;
/// Retention of usage entries and token holds.
pub const TOKEN_TTL_MS: u64 = WINDOW_MS;
/// Retention of worker fairness entries.
pub const FAIRNESS_TTL_MS: u64 = 5_000;
/// Counters reset after this long without an update.
pub const COUNTER_TTL_MS: u64 = 3_600_000;
/// Width of a fairness bucket.
pub const FAIRNESS_BUCKET_MS: u64 = 1_000;

/// Numeric parameters of the planner, derived from [`SchedulerConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotPolicy {
    /// Request budget per trailing window.
    pub safe_rpm: u64,
    /// Token budget per trailing window.
    pub safe_tpm: u64,
    /// Minimum distance between two reservations.
    pub min_spacing_ms: u64,
    /// Fairness penalty.
    pub worker_slot_penalty_ms: u64,
    /// Multiplier on the proportional token backoff.
    pub tpm_backoff_scale: f64,
}

impl SlotPolicy {
    /// Derive the policy from a validated configuration.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            safe_rpm: config.safe_rpm().max(1),
            safe_tpm: config.safe_tpm().max(1),
            min_spacing_ms: config.min_spacing_ms(),
            worker_slot_penalty_ms: config.worker_slot_penalty_ms,
            tpm_backoff_scale: config.tpm_backoff_scale,
        }
    }

    /// Coerce an estimate into `[1, safe_tpm]`.
    #[must_use]
    pub fn clamp_estimate(&self, estimated_tokens: u64) -> u64 {
        estimated_tokens.clamp(1, self.safe_tpm)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn proportional_delay(&self, overshoot: u64) -> u64 {
        let scaled = (overshoot as f64 / self.safe_tpm as f64)
            * WINDOW_MS as f64
            * self.tpm_backoff_scale;
        (scaled.floor().max(0.0) as u64).max(self.min_spacing_ms)
    }
}

/// Read-only view of the windows a plan is computed against.
#[derive(Debug, Clone, Copy)]
pub struct WindowView<'a> {
    /// Scheduled times of live reservations, ascending.
    pub reservations: &'a [u64],
    /// `(timestamp_ms, tokens)` of usage entries and open token holds.
    pub tokens: &'a [(u64, u64)],
    /// Whether the worker already reserved in the current fairness bucket.
    pub worker_in_bucket: bool,
}

/// Result of [`plan_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPlan {
    /// Granted start time.
    pub scheduled_ms: u64,
    /// Estimate after clamping.
    pub estimated_tokens: u64,
    /// Whether the fairness penalty was applied.
    pub penalized: bool,
    /// Guard passes taken.
    pub passes: usize,
}

/// Fairness bucket of a timestamp.
#[must_use]
pub const fn fairness_bucket(timestamp_ms: u64) -> u64 {
    timestamp_ms / FAIRNESS_BUCKET_MS
}

/// Whether `t` falls in the window `(end - WINDOW_MS, end]`.
#[must_use]
pub const fn in_window(t: u64, end: u64) -> bool {
    t <= end && t + WINDOW_MS > end
}

/// Compute the earliest admissible slot at or after `now_ms`.
#[must_use]
pub fn plan_slot(policy: &SlotPolicy, view: WindowView<'_>, now_ms: u64, estimated_tokens: u64) -> SlotPlan {
    let res = view.reservations;
    let spacing = policy.min_spacing_ms;
    let estimate = policy.clamp_estimate(estimated_tokens);

    let before_now = res.partition_point(|&t| t <= now_ms);
    let mut candidate = match before_now {
        0 => now_ms,
        n => now_ms.max(res[n - 1] + spacing),
    };

    let timeline = TokenTimeline::new(view.tokens);
    let max_passes = 4 * (res.len() + view.tokens.len()) + 16;
    let mut penalized = false;
    let mut passes = 0;

    loop {
        passes += 1;
        if passes > max_passes {
            candidate = candidate.max(safe_fallback(res, view.tokens, spacing));
            break;
        }

        let start = candidate;
        candidate = clear_spacing(res, candidate, spacing);
        candidate = clear_rpm(policy, res, candidate);
        if candidate != start {
            continue;
        }
        candidate = clear_tpm(policy, &timeline, candidate, estimate);
        if candidate != start {
            continue;
        }
        if view.worker_in_bucket && !penalized {
            penalized = true;
            candidate += policy.worker_slot_penalty_ms;
            continue;
        }
        break;
    }

    SlotPlan {
        scheduled_ms: candidate,
        estimated_tokens: estimate,
        penalized,
        passes,
    }
}

fn clear_spacing(res: &[u64], mut candidate: u64, spacing: u64) -> u64 {
    loop {
        let first_near = res.partition_point(|&t| t + spacing <= candidate);
        match res.get(first_near) {
            Some(&r) if r < candidate + spacing => candidate = r + spacing,
            _ => return candidate,
        }
    }
}

fn window_count(res: &[u64], end: u64) -> (usize, usize) {
    let lo = res.partition_point(|&t| t + WINDOW_MS <= end);
    let hi = res.partition_point(|&t| t <= end);
    (lo, hi)
}

fn clear_rpm(policy: &SlotPolicy, res: &[u64], candidate: u64) -> u64 {
    let limit = usize::try_from(policy.safe_rpm).unwrap_or(usize::MAX);

    let (lo, hi) = window_count(res, candidate);
    if hi - lo >= limit {
        // The window start is exclusive, so expiry of the oldest counted
        // entry is enough.
        return res[hi - limit] + WINDOW_MS;
    }

    // Later windows that would also contain the candidate.
    for &r in &res[hi..] {
        if r >= candidate + WINDOW_MS {
            break;
        }
        let (lo, hi) = window_count(res, r);
        if hi - lo >= limit {
            return r + policy.min_spacing_ms;
        }
    }
    candidate
}

/// Token entries sorted by time, with prefix sums for window totals.
struct TokenTimeline {
    times: Vec<u64>,
    prefix: Vec<u64>,
}

impl TokenTimeline {
    fn new(tokens: &[(u64, u64)]) -> Self {
        let mut sorted = tokens.to_vec();
        sorted.sort_unstable_by_key(|&(t, _)| t);
        let mut prefix = Vec::with_capacity(sorted.len() + 1);
        prefix.push(0_u64);
        for &(_, amount) in &sorted {
            let last = prefix.last().copied().unwrap_or(0);
            prefix.push(last.saturating_add(amount));
        }
        Self {
            times: sorted.into_iter().map(|(t, _)| t).collect(),
            prefix,
        }
    }

    /// Index range of the entries in the window ending at `end`.
    fn window(&self, end: u64) -> (usize, usize) {
        window_count(&self.times, end)
    }

    fn sum(&self, lo: usize, hi: usize) -> u64 {
        self.prefix[hi] - self.prefix[lo]
    }
}

fn clear_tpm(policy: &SlotPolicy, timeline: &TokenTimeline, candidate: u64, estimate: u64) -> u64 {
    let (lo, hi) = timeline.window(candidate);
    let needed = timeline.sum(lo, hi).saturating_add(estimate);
    if needed > policy.safe_tpm {
        let overshoot = needed - policy.safe_tpm;
        let window_delay = timeline
            .times
            .get(lo)
            .map_or(0, |&earliest| (earliest + WINDOW_MS).saturating_sub(candidate));
        return candidate + window_delay.max(policy.proportional_delay(overshoot));
    }

    // Windows ending at later entries would also hold the candidate.
    for &t in &timeline.times[hi..] {
        if t >= candidate + WINDOW_MS {
            break;
        }
        let (lo, hi) = timeline.window(t);
        if timeline.sum(lo, hi).saturating_add(estimate) > policy.safe_tpm {
            return t + 1;
        }
    }
    candidate
}

fn safe_fallback(res: &[u64], tokens: &[(u64, u64)], spacing: u64) -> u64 {
    let last_res = res.last().copied().unwrap_or(0);
    let last_tok = tokens.iter().map(|&(t, _)| t).max().unwrap_or(0);
    last_res.max(last_tok) + WINDOW_MS + spacing
}
