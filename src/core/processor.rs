//! Per-worker request processing.
//!
//! A unit of work runs `Estimate -> Reserve -> Wait -> Confirm -> Execute ->
//! Record` and ends in success, a retry after a provider rate limit, or a
//! failure. The wait is the only suspension point besides the external call
//! itself; no lock is held across it.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ProcessorConfig;
use crate::metrics::{CallOutcome, MetricsExporter};

use super::estimator::{TokenEstimate, TokenEstimator};
use super::store::TokenHandle;
use super::{CallError, ExternalCall, ProcessError, ReservationScheduler, TokenUsage};

/// Outcome of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult<T> {
    /// External call output.
    pub output: T,
    /// Worker that ran the unit.
    pub worker_id: String,
    /// Total time spent waiting for slots, jitter included.
    pub wait_time_ms: u64,
    /// Submission to result.
    pub total_duration_ms: u64,
    /// Duration of the successful external call.
    pub processing_time_ms: u64,
    /// Whether the final slot came from the store.
    pub guaranteed: bool,
    /// Request utilization at the final grant.
    pub rpm_utilization_percent: f64,
    /// Token utilization at the final grant.
    pub tpm_utilization_percent: f64,
    /// Attempts, including rate-limited ones.
    pub attempts: u32,
    /// Estimate reserved for the final attempt.
    pub estimated_tokens: u64,
    /// Provider-reported usage. `None` means the estimate was recorded instead.
    pub usage: Option<TokenUsage>,
}

/// Releases a token hold when dropped before it was finalized.
///
/// Keeps the token budget intact when the unit's future is cancelled between
/// reserving and recording.
#[derive(Debug)]
struct TokenHold {
    scheduler: Arc<ReservationScheduler>,
    handle: Option<TokenHandle>,
}

impl TokenHold {
    const fn new(scheduler: Arc<ReservationScheduler>, handle: Option<TokenHandle>) -> Self {
        Self { scheduler, handle }
    }

    async fn finalize(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => self.scheduler.finalize_token_reservation(&handle).await,
            None => false,
        }
    }
}

impl Drop for TokenHold {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let scheduler = Arc::clone(&self.scheduler);
                rt.spawn(async move {
                    scheduler.finalize_token_reservation(&handle).await;
                });
            }
            Err(_) => {
                warn!(nonce = %handle.nonce, "no runtime to release token hold; leaving it to expire");
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Runs units of work for one worker against a shared scheduler.
#[derive(Debug)]
pub struct RequestProcessor<P, T, C> {
    worker_id: String,
    config: ProcessorConfig,
    scheduler: Arc<ReservationScheduler>,
    call: C,
    estimator: TokenEstimator,
    exporter: Option<Arc<MetricsExporter>>,
    _marker: PhantomData<fn(P) -> T>,
}

impl<P, T, C> RequestProcessor<P, T, C>
where
    P: Serialize + Send + Sync + 'static,
    T: Send + 'static,
    C: ExternalCall<P, T>,
{
    /// Create a processor for `worker_id`.
    pub fn new(
        worker_id: impl Into<String>,
        config: &ProcessorConfig,
        scheduler: Arc<ReservationScheduler>,
        call: C,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            config: config.clone(),
            scheduler,
            call,
            estimator: TokenEstimator::new(config),
            exporter: None,
            _marker: PhantomData,
        }
    }

    /// Report outcomes and waits to `exporter`.
    #[must_use]
    pub fn with_exporter(mut self, exporter: Arc<MetricsExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Worker id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The worker's estimator.
    #[must_use]
    pub const fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Cooperative backpressure hint, in milliseconds.
    #[must_use]
    pub fn throttle_delay_ms(&self) -> u64 {
        self.estimator.throttle_delay_ms()
    }

    /// Drop the rolling estimation state.
    pub fn reset(&mut self) {
        self.estimator.reset();
    }

    /// Estimate the cost of `payload` without reserving anything.
    pub fn estimate(&self, payload: &P) -> TokenEstimate {
        self.estimator.estimate(self.call.prompt_chars(payload))
    }

    /// Run one unit of work to completion.
    ///
    /// Rate-limit rejections are retried according to the configured
    /// [`RetryPolicy`](crate::config::RetryPolicy); any other call failure is
    /// returned as [`ProcessError::Execution`]. Token holds are released on
    /// every path, including cancellation.
    pub async fn submit_unit(&mut self, payload: P) -> Result<UnitResult<T>, ProcessError> {
        let submitted = Instant::now();
        let mut total_wait_ms = 0_u64;
        let mut attempts = 0_u32;

        loop {
            attempts += 1;

            let estimate = self.estimate(&payload);

            let grant = self
                .scheduler
                .reserve_slot(&self.worker_id, estimate.tokens)
                .await;
            if grant.guaranteed {
                self.estimator
                    .record_utilization(grant.metrics.tpm_utilization_percent);
            }
            let mut hold = TokenHold::new(Arc::clone(&self.scheduler), grant.handle.clone());

            let wait_ms = grant.wait_ms.saturating_add(self.jitter_ms());
            if let Some(exporter) = &self.exporter {
                exporter.observe_wait(grant.guaranteed, wait_ms);
            }
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            total_wait_ms = total_wait_ms.saturating_add(wait_ms);

            // Fallback grants never entered the timeline, so there is nothing to confirm.
            let ticket = if grant.guaranteed {
                Some(
                    self.scheduler
                        .confirm_reservation(&self.worker_id, grant.scheduled_ms)
                        .await,
                )
            } else {
                None
            };

            let call_started = Instant::now();
            let result = self.call.call(&payload).await;
            let processing_time_ms = millis(call_started.elapsed());
            if let Some(ticket) = &ticket {
                self.scheduler.complete_request(ticket).await;
            }

            match result {
                Ok(response) => {
                    let usage = response.usage;
                    match usage {
                        Some(usage) => {
                            self.scheduler
                                .record_token_usage(usage.input_tokens, usage.output_tokens)
                                .await;
                            self.estimator.record_usage(usage);
                        }
                        None => {
                            debug!(
                                worker_id = %self.worker_id,
                                estimate = estimate.tokens,
                                "no usage reported; recording estimate"
                            );
                            self.scheduler.record_token_usage(estimate.tokens, 0).await;
                        }
                    }
                    hold.finalize().await;
                    self.record_outcome(CallOutcome::Success);

                    return Ok(UnitResult {
                        output: response.output,
                        worker_id: self.worker_id.clone(),
                        wait_time_ms: total_wait_ms,
                        total_duration_ms: millis(submitted.elapsed()),
                        processing_time_ms,
                        guaranteed: grant.guaranteed,
                        rpm_utilization_percent: grant.metrics.rpm_utilization_percent,
                        tpm_utilization_percent: grant.metrics.tpm_utilization_percent,
                        attempts,
                        estimated_tokens: estimate.tokens,
                        usage,
                    });
                }
                Err(CallError::RateLimited { message }) => {
                    hold.finalize().await;
                    self.record_outcome(CallOutcome::RateLimit);
                    warn!(
                        worker_id = %self.worker_id,
                        attempts,
                        guaranteed = grant.guaranteed,
                        %message,
                        "provider rate limit despite reservation"
                    );
                    if !self.config.retry.allows_retry(attempts) {
                        return Err(ProcessError::RateLimitRetriesExhausted { attempts });
                    }
                }
                Err(CallError::Failed(e)) => {
                    hold.finalize().await;
                    self.record_outcome(CallOutcome::Error);
                    return Err(ProcessError::Execution(e));
                }
            }
        }
    }

    fn jitter_ms(&self) -> u64 {
        match self.config.max_jitter_ms {
            0 => 0,
            max => rand::rng().random_range(0..max),
        }
    }

    fn record_outcome(&self, outcome: CallOutcome) {
        if let Some(exporter) = &self.exporter {
            exporter.record_outcome(outcome);
        }
    }
}
