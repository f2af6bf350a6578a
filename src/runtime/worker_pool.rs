//! Pool of request processors fed by a bounded MPMC queue.
//!
//! Each worker is a tokio task that owns one [`RequestProcessor`] (and with it
//! one estimator) under the id `worker-{n}`. Submissions travel over a bounded
//! `flume` channel and the result comes back on a `oneshot`.
//!
//! # Example
//!
//! ```rust,ignore
//! let pool = WorkerPool::new(&ProcessorConfig::new().with_worker_count(4), scheduler, call, None)?;
//! let result = pool.submit_unit(prompt).await?;
//! pool.shutdown().await;
//! ```

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProcessorConfig;
use crate::core::{
    ExternalCall, PoolError, ProcessError, RequestProcessor, ReservationScheduler, UnitResult,
};
use crate::metrics::MetricsExporter;

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of workers.
    pub worker_count: usize,
    /// Submission queue capacity.
    pub queue_depth: usize,
    /// Units waiting for a worker.
    pub queued: u64,
    /// Units a worker is processing.
    pub in_flight: u64,
    /// Units accepted.
    pub submitted: u64,
    /// Units that succeeded.
    pub completed: u64,
    /// Units that failed.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    queued: AtomicU64,
    in_flight: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self, worker_count: usize, queue_depth: usize) -> PoolStats {
        PoolStats {
            worker_count,
            queue_depth,
            queued: self.queued.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<UnitResult<T>, ProcessError>>;

struct WorkItem<P, T> {
    payload: P,
    reply: Reply<T>,
}

/// Runs units of work on a fixed set of request processors.
pub struct WorkerPool<P, T, C> {
    worker_count: usize,
    queue_depth: usize,
    task_tx: Mutex<Option<flume::Sender<WorkItem<P, T>>>>,
    counters: Arc<PoolCounters>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    _call: PhantomData<fn() -> C>,
}

impl<P, T, C> std::fmt::Debug for WorkerPool<P, T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("queue_depth", &self.queue_depth)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<P, T, C> WorkerPool<P, T, C>
where
    P: Serialize + Send + Sync + 'static,
    T: Send + 'static,
    C: ExternalCall<P, T>,
{
    /// Spawn `config.worker_count` workers on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// - `PoolError::InvalidConfig` if the processor configuration is invalid
    /// - `PoolError::Internal` if called outside a tokio runtime
    pub fn new(
        config: &ProcessorConfig,
        scheduler: Arc<ReservationScheduler>,
        call: C,
        exporter: Option<Arc<MetricsExporter>>,
    ) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PoolError::Internal(format!("worker pool needs a tokio runtime: {e}")))?;

        let (task_tx, task_rx) = flume::bounded::<WorkItem<P, T>>(config.queue_depth);
        let counters = Arc::new(PoolCounters::default());

        let mut workers = Vec::with_capacity(config.worker_count);
        for n in 0..config.worker_count {
            let mut processor =
                RequestProcessor::new(format!("worker-{n}"), config, Arc::clone(&scheduler), call.clone());
            if let Some(exporter) = &exporter {
                processor = processor.with_exporter(Arc::clone(exporter));
            }
            workers.push(runtime.spawn(run_worker(processor, task_rx.clone(), Arc::clone(&counters))));
        }

        info!(
            worker_count = config.worker_count,
            queue_depth = config.queue_depth,
            "worker pool started"
        );

        Ok(Self {
            worker_count: config.worker_count,
            queue_depth: config.queue_depth,
            task_tx: Mutex::new(Some(task_tx)),
            counters,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(workers),
            _call: PhantomData,
        })
    }

    /// Run one unit of work on the next free worker and wait for its result.
    ///
    /// # Errors
    ///
    /// - `PoolError::QueueFull` if the submission queue is full
    /// - `PoolError::PoolShutdown` if the pool has been shut down
    /// - `PoolError::WorkerGone` if the worker stopped without replying
    /// - `PoolError::Process` if the unit itself failed
    pub async fn submit_unit(&self, payload: P) -> Result<UnitResult<T>, PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown);
        }
        let (reply, rx) = oneshot::channel();
        {
            let guard = self.task_tx.lock();
            let Some(task_tx) = guard.as_ref() else {
                return Err(PoolError::PoolShutdown);
            };
            // Counted before sending so a fast worker never decrements first.
            self.counters.queued.fetch_add(1, Ordering::Relaxed);
            match task_tx.try_send(WorkItem { payload, reply }) {
                Ok(()) => {
                    self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                }
                Err(flume::TrySendError::Full(_)) => {
                    self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                    warn!("worker pool queue is full");
                    return Err(PoolError::QueueFull);
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                    return Err(PoolError::PoolShutdown);
                }
            }
        }
        rx.await
            .map_err(|_| PoolError::WorkerGone)?
            .map_err(PoolError::from)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.worker_count, self.queue_depth)
    }

    /// Stop accepting units, let workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down worker pool");
        self.task_tx.lock().take();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for (idx, worker) in workers.into_iter().enumerate() {
            match worker.await {
                Ok(()) => debug!(worker = idx, "worker joined"),
                Err(e) => warn!(worker = idx, error = %e, "worker ended abnormally"),
            }
        }
        info!(worker_count = self.worker_count, "worker pool shut down");
    }
}

impl<P, T, C> Drop for WorkerPool<P, T, C> {
    fn drop(&mut self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            // Workers exit once the queue drains.
            self.task_tx.lock().take();
            debug!("worker pool dropped without explicit shutdown");
        }
    }
}

async fn run_worker<P, T, C>(
    mut processor: RequestProcessor<P, T, C>,
    task_rx: flume::Receiver<WorkItem<P, T>>,
    counters: Arc<PoolCounters>,
) where
    P: Serialize + Send + Sync + 'static,
    T: Send + 'static,
    C: ExternalCall<P, T>,
{
    while let Ok(item) = task_rx.recv_async().await {
        counters.queued.fetch_sub(1, Ordering::Relaxed);
        counters.in_flight.fetch_add(1, Ordering::Relaxed);

        let result = processor.submit_unit(item.payload).await;

        counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        if result.is_ok() {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        if item.reply.send(result).is_err() {
            debug!(worker_id = processor.worker_id(), "submitter dropped before the result arrived");
        }

        let delay_ms = processor.throttle_delay_ms();
        if delay_ms > 0 {
            debug!(worker_id = processor.worker_id(), delay_ms, "throttling worker");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }
    debug!(worker_id = processor.worker_id(), "worker exiting");
}
