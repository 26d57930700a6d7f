//! Bounded worker pool that scores planned batches.
//!
//! Workers pull batches from a shared ordered queue and push one
//! [`BatchResult`] per batch into a channel consumed by the job controller.
//! For each batch a worker:
//!
//! 1. answers what it can from the [`ScoreCache`]
//! 2. sends the misses to the remote scorer if the [`CircuitBreaker`] allows it
//! 3. scores whatever is still unscored with the local scorer
//!
//! Remote failures are absorbed (recorded against the breaker, then local
//! fallback). A local failure marks the affected records as failed and the
//! worker moves on to the next batch. A scorer that panics is treated the
//! same way as one that returns an error.
//!
//! Cancellation is checked before every dequeue, so in-flight batches always
//! finish and no new batch starts once the signal is observed.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::error::ScorerError;
use crate::metrics::MetricsCollector;
use crate::planner::MemoryMonitor;
use crate::scoring::{CircuitBreaker, LocalScorer, RemoteScorer, ScoreCache, ScoreOutcome};
use crate::types::{Batch, OperationType, Record, RecordFailure, ScoreResult, ScoreSource};

/// Errors surfaced on the pool's output stream.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// A worker task panicked outside a scorer call; the batch it was
    /// scoring is lost.
    #[error("Worker {worker_id} panicked: {message}")]
    WorkerPanicked { worker_id: usize, message: String },
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on concurrently scored batches.
    pub max_workers: usize,
    /// Maximum time allowed for one remote scorer call.
    pub remote_timeout: Duration,
    /// Issue a memory-reclaim hint after this many completed batches.
    pub reclaim_every_batches: usize,
    /// Capacity of the result channel toward the controller.
    pub channel_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            remote_timeout: Duration::from_secs(30),
            reclaim_every_batches: 5,
            channel_capacity: 64,
        }
    }
}

/// CPU count times two, never zero.
pub fn default_max_workers() -> usize {
    (num_cpus::get() * 2).max(1)
}

impl PoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Default::default()
        }
    }

    /// Sets the remote call timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Sets the reclaim interval in batches.
    pub fn with_reclaim_every_batches(mut self, batches: usize) -> Self {
        self.reclaim_every_batches = batches;
        self
    }

    /// Sets the result channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

/// Outcome of scoring one batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_index: usize,
    pub total_batches: usize,
    /// Number of records in the batch.
    pub record_count: usize,
    /// Scored records, in batch order.
    pub results: Vec<ScoreResult>,
    /// Records the local scorer could not score.
    pub failures: Vec<RecordFailure>,
    pub remote_count: usize,
    pub local_count: usize,
    pub cache_hits: usize,
    /// Why the remote path was abandoned for this batch, if it was.
    pub remote_error: Option<ScorerError>,
    /// Why the local path failed for this batch, if it did.
    pub local_error: Option<ScorerError>,
    pub elapsed: Duration,
    pub worker_id: usize,
}

impl BatchResult {
    /// True when every record of the batch was scored.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Metric label: `failed` if any record failed, `degraded` if the remote
    /// path was abandoned, otherwise `ok`.
    pub fn status_label(&self) -> &'static str {
        if !self.failures.is_empty() {
            "failed"
        } else if self.remote_error.is_some() {
            "degraded"
        } else {
            "ok"
        }
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Configured worker limit.
    pub max_workers: usize,
    /// Number of workers currently scoring a batch.
    pub active_workers: usize,
    /// Batches whose records were all scored.
    pub batches_completed: u64,
    /// Batches with at least one failed record.
    pub batches_failed: u64,
    pub records_remote: u64,
    pub records_local: u64,
    pub records_cached: u64,
    /// Average batch processing duration.
    pub average_batch_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of batches processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.batches_completed + self.batches_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.batches_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    batches_finished: AtomicU64,
    records_remote: AtomicU64,
    records_local: AtomicU64,
    records_cached: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            batches_completed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batches_finished: AtomicU64::new(0),
            records_remote: AtomicU64::new(0),
            records_local: AtomicU64::new(0),
            records_cached: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    /// Records a finished batch and returns how many batches have finished.
    fn record_batch(&self, result: &BatchResult) -> u64 {
        if result.is_complete() {
            self.batches_completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.batches_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.records_remote
            .fetch_add(result.remote_count as u64, Ordering::SeqCst);
        self.records_local
            .fetch_add(result.local_count as u64, Ordering::SeqCst);
        self.records_cached
            .fetch_add(result.cache_hits as u64, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(result.elapsed.as_millis() as u64, Ordering::SeqCst);

        self.batches_finished.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, max_workers: usize) -> PoolStats {
        let completed = self.batches_completed.load(Ordering::SeqCst);
        let failed = self.batches_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_batch_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            max_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            batches_completed: completed,
            batches_failed: failed,
            records_remote: self.records_remote.load(Ordering::SeqCst),
            records_local: self.records_local.load(Ordering::SeqCst),
            records_cached: self.records_cached.load(Ordering::SeqCst),
            average_batch_duration,
        }
    }
}

/// Resources every worker of one run shares.
struct Shared {
    operation: OperationType,
    remote: Option<Arc<dyn RemoteScorer>>,
    local: Arc<dyn LocalScorer>,
    cache: Arc<ScoreCache>,
    breaker: Arc<CircuitBreaker>,
    memory: Arc<MemoryMonitor>,
    queue: Mutex<VecDeque<Batch>>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    remote_timeout: Duration,
    reclaim_every_batches: usize,
}

/// Worker pool executing planned batches with bounded concurrency.
pub struct WorkerPool {
    config: PoolConfig,
    cache: Arc<ScoreCache>,
    breaker: Arc<CircuitBreaker>,
    memory: Arc<MemoryMonitor>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a pool around the process-wide cache, breaker and memory monitor.
    pub fn new(
        config: PoolConfig,
        cache: Arc<ScoreCache>,
        breaker: Arc<CircuitBreaker>,
        memory: Arc<MemoryMonitor>,
    ) -> Self {
        Self {
            config,
            cache,
            breaker,
            memory,
            stats: Arc::new(SharedPoolStats::new()),
        }
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.max_workers)
    }

    /// Runs `batches` and returns a stream of per-batch outcomes.
    ///
    /// At most `max_workers` batches are scored at once. The stream ends when
    /// every worker has stopped, either because the queue drained or because
    /// `cancel` turned true. Results arrive in completion order, not batch
    /// order.
    pub fn run(
        &self,
        batches: Vec<Batch>,
        operation: OperationType,
        remote: Option<Arc<dyn RemoteScorer>>,
        local: Arc<dyn LocalScorer>,
        cancel: watch::Receiver<bool>,
    ) -> ReceiverStream<Result<BatchResult, PoolError>> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let num_workers = self.config.max_workers.max(1).min(batches.len());

        let shared = Arc::new(Shared {
            operation,
            remote,
            local,
            cache: Arc::clone(&self.cache),
            breaker: Arc::clone(&self.breaker),
            memory: Arc::clone(&self.memory),
            queue: Mutex::new(batches.into()),
            stats: Arc::clone(&self.stats),
            metrics: MetricsCollector::new(),
            remote_timeout: self.config.remote_timeout,
            reclaim_every_batches: self.config.reclaim_every_batches,
        });

        let handles: Vec<JoinHandle<()>> = (0..num_workers)
            .map(|id| {
                let worker = Worker::new(id, Arc::clone(&shared), tx.clone(), cancel.clone());
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            workers = num_workers,
            max_workers = self.config.max_workers,
            "Worker pool started"
        );

        // The supervisor holds the last sender, so the stream closes only
        // after every panic has been reported.
        tokio::spawn(async move {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        let message = panic_message(e.into_panic());
                        error!(worker_id = worker_id, error = %message, "Worker task panicked");
                        let _ = tx
                            .send(Err(PoolError::WorkerPanicked { worker_id, message }))
                            .await;
                    }
                }
            }
            debug!("Worker pool drained");
        });

        ReceiverStream::new(rx)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A single worker pulling batches from the shared queue.
struct Worker {
    id: usize,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Result<BatchResult, PoolError>>,
    cancel: watch::Receiver<bool>,
}

impl Worker {
    fn new(
        id: usize,
        shared: Arc<Shared>,
        tx: mpsc::Sender<Result<BatchResult, PoolError>>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            shared,
            tx,
            cancel,
        }
    }

    /// Main worker loop.
    async fn run(self) {
        debug!(worker_id = self.id, "Worker started");

        loop {
            if *self.cancel.borrow() {
                debug!(worker_id = self.id, "Worker observed cancellation");
                break;
            }

            let Some(batch) = self.shared.queue.lock().pop_front() else {
                break;
            };

            self.shared.stats.increment_active();
            self.shared.metrics.worker_started();
            let result = self.process_batch(&batch).await;
            self.shared.metrics.worker_finished();
            self.shared.stats.decrement_active();

            self.shared.metrics.record_batch(
                result.status_label(),
                result.remote_count,
                result.local_count,
                result.cache_hits,
                result.failures.len(),
            );
            let finished = self.shared.stats.record_batch(&result);
            if self.shared.reclaim_every_batches > 0
                && finished % self.shared.reclaim_every_batches as u64 == 0
            {
                self.reclaim(finished);
            }

            if self.tx.send(Ok(result)).await.is_err() {
                warn!(worker_id = self.id, "Result receiver dropped, stopping worker");
                break;
            }
        }

        debug!(worker_id = self.id, "Worker stopped");
    }

    /// Scores one batch: cache, then remote (if allowed), then local.
    async fn process_batch(&self, batch: &Batch) -> BatchResult {
        let started = Instant::now();
        let records = batch.records();
        let mut slots: Vec<Option<ScoreResult>> = vec![None; records.len()];

        let mut cache_hits = 0;
        for (slot, record) in slots.iter_mut().zip(records) {
            if let Some(hit) = self.shared.cache.lookup(self.shared.operation, record) {
                *slot = Some(hit);
                cache_hits += 1;
            }
        }

        let mut remote_count = 0;
        let mut remote_error = None;
        if let Some(remote) = self.shared.remote.as_ref() {
            let pending = unscored(&slots);
            if !pending.is_empty() && self.shared.breaker.allow_remote() {
                let request = select_records(records, &pending);
                let call_started = Instant::now();
                let call = AssertUnwindSafe(remote.score(self.shared.operation, &request));
                let response =
                    match tokio::time::timeout(self.shared.remote_timeout, call.catch_unwind()).await
                    {
                        Ok(Ok(response)) => response,
                        // a panicking probe must still report back to the breaker
                        Ok(Err(payload)) => Err(ScorerError::ServiceError {
                            code: 500,
                            message: format!(
                                "remote scorer panicked: {}",
                                panic_message(payload)
                            ),
                        }),
                        Err(_) => Err(ScorerError::Timeout(self.shared.remote_timeout)),
                    };
                let call_elapsed = call_started.elapsed();
                self.shared.metrics.record_remote_latency(call_elapsed);

                match ScoreOutcome::classify(&request, response) {
                    ScoreOutcome::Success(results) => {
                        self.shared.breaker.record_success(call_elapsed, request.len());
                        remote_count = self.place(
                            records,
                            &pending,
                            &mut slots,
                            results,
                            ScoreSource::Remote,
                            true,
                        );
                    }
                    ScoreOutcome::RecoverableFailure { error, partial } => {
                        self.shared.breaker.record_failure_since(call_started);
                        remote_count = self.place(
                            records,
                            &pending,
                            &mut slots,
                            partial,
                            ScoreSource::Remote,
                            true,
                        );
                        remote_error = Some(error);
                    }
                    ScoreOutcome::FatalFailure(error) => {
                        self.shared.breaker.record_failure_since(call_started);
                        remote_error = Some(error);
                    }
                }

                if let Some(ref e) = remote_error {
                    warn!(
                        worker_id = self.id,
                        batch_index = batch.batch_index,
                        scorer = remote.name(),
                        error = %e,
                        "Remote scoring failed, falling back to local scorer"
                    );
                }
            }
        }

        let mut local_count = 0;
        let mut local_error = None;
        let mut failures = Vec::new();
        let pending = unscored(&slots);
        if !pending.is_empty() {
            let request = select_records(records, &pending);
            let response = AssertUnwindSafe(self.shared.local.score(self.shared.operation, &request))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(ScorerError::LocalFailure(format!(
                        "local scorer panicked: {}",
                        panic_message(payload)
                    )))
                });

            let error = match ScoreOutcome::classify(&request, response) {
                ScoreOutcome::Success(results) => {
                    local_count = self.place(
                        records,
                        &pending,
                        &mut slots,
                        results,
                        ScoreSource::Local,
                        false,
                    );
                    None
                }
                ScoreOutcome::RecoverableFailure { error, partial } => {
                    local_count = self.place(
                        records,
                        &pending,
                        &mut slots,
                        partial,
                        ScoreSource::Local,
                        false,
                    );
                    Some(error)
                }
                ScoreOutcome::FatalFailure(error) => Some(error),
            };

            if let Some(error) = error {
                let reason = error.to_string();
                for (slot, record) in slots.iter().zip(records) {
                    if slot.is_none() {
                        failures.push(RecordFailure {
                            record_id: record.id.clone(),
                            batch_index: batch.batch_index,
                            reason: reason.clone(),
                        });
                    }
                }
                error!(
                    worker_id = self.id,
                    batch_index = batch.batch_index,
                    failed_records = failures.len(),
                    error = %error,
                    "Local scoring failed for batch"
                );
                local_error = Some(error);
            }
        }

        let elapsed = started.elapsed();
        debug!(
            worker_id = self.id,
            batch_index = batch.batch_index,
            records = records.len(),
            cache_hits = cache_hits,
            remote = remote_count,
            local = local_count,
            failed = failures.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch scored"
        );

        BatchResult {
            batch_index: batch.batch_index,
            total_batches: batch.total_batches,
            record_count: records.len(),
            results: slots.into_iter().flatten().collect(),
            failures,
            remote_count,
            local_count,
            cache_hits,
            remote_error,
            local_error,
            elapsed,
            worker_id: self.id,
        }
    }

    /// Puts scorer results into their record slots and returns how many
    /// were placed. Remote results are also cached.
    fn place(
        &self,
        records: &[Record],
        pending: &[usize],
        slots: &mut [Option<ScoreResult>],
        results: Vec<ScoreResult>,
        source: ScoreSource,
        cache: bool,
    ) -> usize {
        let positions: HashMap<&str, usize> = pending
            .iter()
            .map(|&i| (records[i].id.as_str(), i))
            .collect();

        let mut placed = 0;
        for result in results {
            let Some(&index) = positions.get(result.record_id.as_str()) else {
                continue;
            };
            if slots[index].is_some() {
                continue;
            }
            let result = result.with_source(source);
            if cache {
                self.shared
                    .cache
                    .store(self.shared.operation, &records[index], &result);
            }
            slots[index] = Some(result);
            placed += 1;
        }
        placed
    }

    /// Memory-reclaim hint: drop spare cache capacity and refresh the
    /// memory reading.
    fn reclaim(&self, finished: u64) {
        self.shared.cache.shrink_to_fit();
        let available_mb = self.shared.memory.available_mb();
        self.shared.metrics.record_available_memory(available_mb);
        debug!(
            worker_id = self.id,
            batches_finished = finished,
            available_mb = available_mb,
            cache_entries = self.shared.cache.len(),
            "Memory reclaim hint issued"
        );
    }
}

fn unscored(slots: &[Option<ScoreResult>]) -> Vec<usize> {
    slots
        .iter()
        .enumerate()
        .filter_map(|(i, slot)| slot.is_none().then_some(i))
        .collect()
}

/// The records at `indices`, borrowing the whole slice when nothing is skipped.
fn select_records<'a>(records: &'a [Record], indices: &[usize]) -> Cow<'a, [Record]> {
    if indices.len() == records.len() {
        Cow::Borrowed(records)
    } else {
        Cow::Owned(indices.iter().map(|&i| records[i].clone()).collect())
    }
}
