//! End-to-end job execution.
//!
//! A [`BatchJobController`] owns the process-wide shared state (circuit
//! breaker, score cache, throughput history) and runs [`Job`]s through it:
//! estimate, plan, score on the worker pool, report progress, and hand back
//! a [`JobOutcome`] holding whatever was scored, even when the job did not
//! finish.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::EngineConfig;
use crate::error::{ConfigError, JobError, PlanError};
use crate::metrics::MetricsCollector;
use crate::planner::{BatchPlanner, MemoryMonitor};
use crate::progress::reporter::duration_secs;
use crate::progress::{JobEvent, ProgressReporter, ProgressSink, TimeEstimator};
use crate::scheduler::{BatchResult, PoolError, WorkerPool};
use crate::scoring::{CircuitBreaker, LocalScorer, RemoteScorer, ScoreCache};
use crate::types::{OperationType, Record, RecordFailure, ScoreResult};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    /// Aborted by an unrecoverable error; partial results are still returned.
    Failed,
    /// Stopped by the caller; in-flight batches were allowed to finish.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record set to score with one operation.
///
/// Cloning is cheap; the records are shared.
#[derive(Debug, Clone)]
pub struct Job {
    id: Uuid,
    operation: OperationType,
    records: Arc<[Record]>,
    created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(operation: OperationType, records: impl Into<Arc<[Record]>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            records: records.into(),
            created_at: Utc::now(),
        }
    }

    /// Replaces the generated id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn operation(&self) -> OperationType {
        self.operation
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Aggregate counts for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub total_records: usize,
    pub total_batches: usize,
    pub batches_completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub remote_count: usize,
    pub local_count: usize,
    pub cache_hits: usize,
    #[serde(with = "duration_secs")]
    pub total_time: Duration,
    /// Records per second.
    pub average_speed: f64,
}

impl JobStats {
    /// Share of processed records that were scored, in [0, 1].
    pub fn success_rate(&self) -> f64 {
        let processed = self.succeeded + self.failed;
        if processed == 0 {
            0.0
        } else {
            self.succeeded as f64 / processed as f64
        }
    }

    /// Records neither scored nor reported as failed.
    pub fn unprocessed(&self) -> usize {
        self.total_records
            .saturating_sub(self.succeeded + self.failed)
    }

    fn absorb(&mut self, result: &BatchResult) {
        self.batches_completed += 1;
        self.succeeded += result.results.len();
        self.failed += result.failures.len();
        self.remote_count += result.remote_count;
        self.local_count += result.local_count;
        self.cache_hits += result.cache_hits;
    }
}

/// What a job hands back to its caller.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Scored records, in input order.
    pub results: Vec<ScoreResult>,
    /// Records that could not be scored, in input order.
    pub failures: Vec<RecordFailure>,
    pub stats: JobStats,
    /// Set when the job failed.
    pub error: Option<String>,
}

impl JobOutcome {
    /// True unless every record was scored and the job completed.
    pub fn is_partial(&self) -> bool {
        self.status != JobStatus::Completed || self.results.len() < self.stats.total_records
    }
}

/// Cooperative cancellation for a running job.
///
/// Cancelling lets in-flight batches finish and stops new ones from being
/// dequeued.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Removes a job id from the active set when the run ends.
struct ActiveJobGuard {
    active: Arc<Mutex<HashSet<Uuid>>>,
    job_id: Uuid,
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.job_id);
    }
}

/// Runs jobs against shared breaker, cache and throughput history.
pub struct BatchJobController {
    config: EngineConfig,
    memory: Arc<MemoryMonitor>,
    cache: Arc<ScoreCache>,
    breaker: Arc<CircuitBreaker>,
    estimator: Arc<TimeEstimator>,
    remote: Option<Arc<dyn RemoteScorer>>,
    local: Arc<dyn LocalScorer>,
    sinks: Vec<Arc<dyn ProgressSink>>,
    active: Arc<Mutex<HashSet<Uuid>>>,
    metrics: MetricsCollector,
}

impl BatchJobController {
    /// Creates a controller using `local` as the fallback scorer.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `config` fails validation.
    pub fn new(config: EngineConfig, local: Arc<dyn LocalScorer>) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            memory: Arc::new(MemoryMonitor::system()),
            cache: Arc::new(ScoreCache::with_config(config.cache_config())),
            breaker: Arc::new(CircuitBreaker::new(config.breaker_config())),
            estimator: Arc::new(TimeEstimator::new(config.history_window)),
            remote: None,
            local,
            sinks: Vec::new(),
            active: Arc::new(Mutex::new(HashSet::new())),
            metrics: MetricsCollector::new(),
            config,
        })
    }

    /// Sets the remote scorer. Without one every record is scored locally.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteScorer>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Replaces the memory monitor used for batch sizing.
    pub fn with_memory(mut self, memory: Arc<MemoryMonitor>) -> Self {
        self.memory = memory;
        self
    }

    /// Replaces the throughput estimator, e.g. with one backed by a store.
    pub fn with_estimator(mut self, estimator: Arc<TimeEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Shares a cache with other controllers.
    pub fn with_cache(mut self, cache: Arc<ScoreCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Shares a circuit breaker with other controllers.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Adds an event sink.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn cache(&self) -> &Arc<ScoreCache> {
        &self.cache
    }

    pub fn estimator(&self) -> &Arc<TimeEstimator> {
        &self.estimator
    }

    /// Predicted wall time for scoring `records`, without running anything.
    ///
    /// Uses the estimator's history as loaded so far; call
    /// [`TimeEstimator::hydrate`] first to include durable history.
    pub fn estimate(&self, records: &[Record], operation: OperationType) -> Duration {
        let batches = self
            .planner()
            .batch_size(records)
            .map(|size| records.len().div_ceil(size))
            .unwrap_or(1);
        self.parallel_estimate(operation, records.len(), batches)
    }

    /// Runs `job` to a terminal state.
    ///
    /// Scorer failures never surface here: they are absorbed per batch and
    /// reflected in the outcome's statistics and in `error` events. A scorer
    /// that panics fails only the batch it was scoring. A worker panic outside
    /// a scorer call fails the job but still returns the results scored so far.
    ///
    /// The circuit breaker belongs to the controller, not the job. When jobs
    /// run concurrently on one controller, each job's event stream carries
    /// every `circuit_state_changed` transition observed while it runs,
    /// including ones caused by another job's remote calls.
    ///
    /// # Errors
    ///
    /// Returns `JobError::Plan` if the records cannot be planned (nothing is
    /// scored), or `JobError::AlreadyRunning` if a job with the same id is
    /// in progress on this controller.
    pub async fn run(&self, job: Job, cancel: &CancelHandle) -> Result<JobOutcome, JobError> {
        let _guard = self.claim(job.id)?;
        let operation = job.operation;
        let total_items = job.len();

        info!(
            job_id = %job.id,
            operation = %operation,
            records = total_items,
            "Starting job"
        );

        if let Err(e) = self.estimator.hydrate(operation).await {
            warn!(job_id = %job.id, error = %e, "Failed to load throughput history");
        }

        let batches = match self.planner().plan(Arc::clone(&job.records)) {
            Ok(batches) => batches,
            Err(e) => return Err(self.abort_planning(&job, e).await),
        };
        let total_batches = batches.len();

        let mut reporter = ProgressReporter::new(
            job.id,
            total_items,
            total_batches,
            self.sinks.clone(),
            self.config.publish_timeout,
        );
        reporter
            .emit(JobEvent::Started {
                total_items,
                total_batches,
                estimated_duration: self.parallel_estimate(operation, total_items, total_batches),
            })
            .await;

        let mut transitions = self.breaker.subscribe();
        let mut transitions_open = true;

        let pool = WorkerPool::new(
            self.config.pool_config(),
            Arc::clone(&self.cache),
            Arc::clone(&self.breaker),
            Arc::clone(&self.memory),
        );
        let mut stream = pool.run(
            batches,
            operation,
            self.remote.clone(),
            Arc::clone(&self.local),
            cancel.subscribe(),
        );

        let mut stats = JobStats {
            total_records: total_items,
            total_batches,
            ..Default::default()
        };
        let mut completed: BTreeMap<usize, BatchResult> = BTreeMap::new();
        let mut pool_error: Option<PoolError> = None;

        loop {
            tokio::select! {
                item = stream.next() => {
                    let Some(item) = item else { break };
                    match item {
                        Ok(result) => {
                            stats.absorb(&result);
                            self.report_batch(&mut reporter, operation, &stats, &result).await;
                            completed.insert(result.batch_index, result);
                        }
                        Err(e) => {
                            error!(job_id = %job.id, error = %e, "Worker pool error");
                            pool_error.get_or_insert(e);
                        }
                    }
                }
                transition = transitions.recv(), if transitions_open => {
                    match transition {
                        Ok(t) => reporter.emit(JobEvent::from_transition(&t)).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(job_id = %job.id, skipped = skipped, "Missed circuit transitions");
                        }
                        Err(broadcast::error::RecvError::Closed) => transitions_open = false,
                    }
                }
            }
        }

        // Transitions raised by the last batches.
        loop {
            match transitions.try_recv() {
                Ok(t) => reporter.emit(JobEvent::from_transition(&t)).await,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }

        stats.total_time = reporter.elapsed();
        stats.average_speed = reporter.average_speed();

        let (status, error_message) = if let Some(e) = pool_error {
            let message = format!(
                "Job aborted after {} of {} batches: {}",
                stats.batches_completed, total_batches, e
            );
            reporter
                .emit(JobEvent::Error {
                    message: message.clone(),
                    recoverable: false,
                    batch_index: None,
                })
                .await;
            (JobStatus::Failed, Some(message))
        } else if stats.batches_completed < total_batches && cancel.is_cancelled() {
            let event = reporter.cancelled_event();
            reporter.emit(event).await;
            (JobStatus::Cancelled, None)
        } else {
            let event = reporter.complete_event(stats.succeeded, stats.failed);
            reporter.emit(event).await;
            (JobStatus::Completed, None)
        };

        self.metrics.record_job(status.as_str());
        info!(
            job_id = %job.id,
            status = %status,
            succeeded = stats.succeeded,
            failed = stats.failed,
            batches = stats.batches_completed,
            total_batches = total_batches,
            elapsed_secs = stats.total_time.as_secs_f64(),
            "Job finished"
        );

        let mut results = Vec::with_capacity(stats.succeeded);
        let mut failures = Vec::with_capacity(stats.failed);
        for (_, batch) in completed {
            results.extend(batch.results);
            failures.extend(batch.failures);
        }

        Ok(JobOutcome {
            job_id: job.id,
            status,
            results,
            failures,
            stats,
            error: error_message,
        })
    }

    fn planner(&self) -> BatchPlanner {
        BatchPlanner::new(self.config.planner_config(), Arc::clone(&self.memory))
    }

    fn claim(&self, job_id: Uuid) -> Result<ActiveJobGuard, JobError> {
        if !self.active.lock().insert(job_id) {
            return Err(JobError::AlreadyRunning(job_id.to_string()));
        }
        Ok(ActiveJobGuard {
            active: Arc::clone(&self.active),
            job_id,
        })
    }

    /// Serial estimate spread over the lanes the pool will actually use.
    fn parallel_estimate(
        &self,
        operation: OperationType,
        items: usize,
        batches: usize,
    ) -> Duration {
        let lanes = self.config.max_workers.min(batches).max(1);
        self.estimator.estimate(operation, items) / lanes as u32
    }

    async fn abort_planning(&self, job: &Job, e: PlanError) -> JobError {
        error!(job_id = %job.id, error = %e, "Job planning failed");

        let mut reporter = ProgressReporter::new(
            job.id,
            job.len(),
            0,
            self.sinks.clone(),
            self.config.publish_timeout,
        );
        reporter
            .emit(JobEvent::Error {
                message: e.to_string(),
                recoverable: false,
                batch_index: None,
            })
            .await;
        self.metrics.record_job(JobStatus::Failed.as_str());
        JobError::Plan(e)
    }

    async fn report_batch(
        &self,
        reporter: &mut ProgressReporter,
        operation: OperationType,
        stats: &JobStats,
        result: &BatchResult,
    ) {
        debug!(
            job_id = %reporter.job_id(),
            batch_index = result.batch_index,
            worker_id = result.worker_id,
            remote = result.remote_count,
            local = result.local_count,
            cache_hits = result.cache_hits,
            failed = result.failures.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Batch completed"
        );

        self.estimator
            .record_and_persist(operation, result.record_count, result.elapsed)
            .await;

        if let Some(e) = &result.remote_error {
            reporter
                .emit(JobEvent::Error {
                    message: format!("Remote scoring failed, used local scorer: {}", e),
                    recoverable: true,
                    batch_index: Some(result.batch_index),
                })
                .await;
        }
        if let Some(e) = &result.local_error {
            reporter
                .emit(JobEvent::Error {
                    message: format!(
                        "Local scoring failed for {} records: {}",
                        result.failures.len(),
                        e
                    ),
                    recoverable: true,
                    batch_index: Some(result.batch_index),
                })
                .await;
        }

        let remaining_items = stats
            .total_records
            .saturating_sub(reporter.items_processed() + result.record_count);
        let remaining_batches = stats.total_batches.saturating_sub(stats.batches_completed);
        let eta = self.parallel_estimate(operation, remaining_items, remaining_batches);

        reporter
            .batch_completed(result.batch_index, result.record_count, eta)
            .await;
    }
}
