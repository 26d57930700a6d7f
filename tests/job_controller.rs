//! End-to-end job scenarios driven through the public API with scripted
//! scorer doubles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use feedback_forge::error::{JobError, ScorerError};
use feedback_forge::pipeline::{BatchJobController, CancelHandle, EngineConfig, Job, JobStatus};
use feedback_forge::planner::MemoryMonitor;
use feedback_forge::progress::{
    ChannelSink, EventEnvelope, JobEvent, SqliteHistoryStore, TimeEstimator,
};
use feedback_forge::scoring::{CircuitState, LocalScorer, RemoteScorer};
use feedback_forge::types::{OperationType, Record, ScoreResult, ScoreSource};

// ============================================================================
// Scorer doubles
// ============================================================================

/// Local scorer with optional scripted misbehaviour.
#[derive(Default)]
struct ScriptedLocal {
    calls: AtomicUsize,
    /// Cancel this handle during the n-th call (1-based).
    cancel_on_call: Option<(usize, CancelHandle)>,
    /// Fail any batch containing this record id.
    fail_on: Option<String>,
    /// Panic on any batch containing this record id.
    panic_on: Option<String>,
}

impl ScriptedLocal {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalScorer for ScriptedLocal {
    async fn score(
        &self,
        _operation: OperationType,
        records: &[Record],
    ) -> Result<Vec<ScoreResult>, ScorerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let contains = |id: &Option<String>| {
            id.as_ref()
                .is_some_and(|id| records.iter().any(|r| &r.id == id))
        };

        if contains(&self.panic_on) {
            panic!("scorer crashed");
        }
        if let Some((n, cancel)) = &self.cancel_on_call {
            if call == *n {
                cancel.cancel();
            }
        }
        if contains(&self.fail_on) {
            return Err(ScorerError::LocalFailure("lexicon unavailable".into()));
        }

        Ok(records
            .iter()
            .map(|r| ScoreResult::new(r.id.clone(), 0.1, "general"))
            .collect())
    }
}

/// Remote scorer that always answers with a service error.
#[derive(Default)]
struct DownRemote {
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteScorer for DownRemote {
    async fn score(
        &self,
        _operation: OperationType,
        _records: &[Record],
    ) -> Result<Vec<ScoreResult>, ScorerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ScorerError::ServiceError {
            code: 503,
            message: "upstream unavailable".into(),
        })
    }
}

/// Remote scorer that scores everything it is sent.
#[derive(Default)]
struct HealthyRemote {
    calls: AtomicUsize,
    records_seen: AtomicUsize,
}

#[async_trait]
impl RemoteScorer for HealthyRemote {
    async fn score(
        &self,
        _operation: OperationType,
        records: &[Record],
    ) -> Result<Vec<ScoreResult>, ScorerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.records_seen.fetch_add(records.len(), Ordering::SeqCst);
        Ok(records
            .iter()
            .map(|r| ScoreResult::new(r.id.clone(), 0.8, "support"))
            .collect())
    }
}

/// Remote scorer that labels every result with the operation it was asked for.
#[derive(Default)]
struct OperationEchoRemote {
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteScorer for OperationEchoRemote {
    async fn score(
        &self,
        operation: OperationType,
        records: &[Record],
    ) -> Result<Vec<ScoreResult>, ScorerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(records
            .iter()
            .map(|r| ScoreResult::new(r.id.clone(), 0.2, operation.as_str()))
            .collect())
    }
}

/// Remote scorer that fails only after `delay`.
struct SlowDownRemote {
    delay: Duration,
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteScorer for SlowDownRemote {
    async fn score(
        &self,
        _operation: OperationType,
        _records: &[Record],
    ) -> Result<Vec<ScoreResult>, ScorerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Err(ScorerError::Timeout(self.delay))
    }
}

/// Local scorer that blocks until released.
struct GatedLocal {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl LocalScorer for GatedLocal {
    async fn score(
        &self,
        _operation: OperationType,
        records: &[Record],
    ) -> Result<Vec<ScoreResult>, ScorerError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(records
            .iter()
            .map(|r| ScoreResult::new(r.id.clone(), 0.0, "general"))
            .collect())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Records of exactly `len` characters.
fn records(count: usize, len: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let mut text = format!("feedback {} ", i);
            while text.len() < len {
                text.push('x');
            }
            text.truncate(len);
            Record::new(format!("r-{}", i), text)
        })
        .collect()
}

/// Ten records per batch, scored one batch at a time.
fn small_batch_config() -> EngineConfig {
    EngineConfig::new()
        .with_min_batch_size(10)
        .with_batch_size_multiplier(0.01)
        .with_max_workers(1)
}

fn controller(config: EngineConfig, local: Arc<dyn LocalScorer>) -> BatchJobController {
    BatchJobController::new(config, local)
        .unwrap()
        .with_memory(Arc::new(MemoryMonitor::fixed(8192.0)))
}

fn with_channel(controller: BatchJobController) -> (BatchJobController, mpsc::Receiver<EventEnvelope>) {
    let (sink, rx) = ChannelSink::new(512);
    (controller.with_sink(Arc::new(sink)), rx)
}

fn drain(rx: &mut mpsc::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_short_records_with_abundant_memory_plan_two_batches() {
    let local = Arc::new(ScriptedLocal::default());
    let controller = controller(EngineConfig::new().with_max_workers(2), local.clone());

    let outcome = controller
        .run(
            Job::new(OperationType::Sentiment, records(1000, 80)),
            &CancelHandle::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.stats.total_batches, 2);
    assert_eq!(outcome.results.len(), 1000);
    assert_eq!(local.calls(), 2);
}

#[tokio::test]
async fn test_breaker_opens_after_five_failed_batches() {
    let local = Arc::new(ScriptedLocal::default());
    let remote = Arc::new(DownRemote::default());
    let (controller, mut rx) = with_channel(
        controller(small_batch_config(), local.clone()).with_remote(remote.clone()),
    );

    let outcome = controller
        .run(
            Job::new(OperationType::Sentiment, records(80, 40)),
            &CancelHandle::new(),
        )
        .await
        .unwrap();

    // batches 0..4 try remote and fall back; batch 5 onwards never call it
    assert_eq!(remote.calls.load(Ordering::SeqCst), 5);
    assert_eq!(controller.breaker().state(), CircuitState::Open);

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.results.len(), 80);
    assert_eq!(outcome.stats.remote_count, 0);
    assert_eq!(outcome.stats.local_count, 80);
    assert!(outcome
        .results
        .iter()
        .all(|r| r.source == ScoreSource::Local));

    let events = drain(&mut rx);
    let recoverable_errors = events
        .iter()
        .filter(|e| matches!(e.event, JobEvent::Error { recoverable: true, .. }))
        .count();
    assert_eq!(recoverable_errors, 5);
    assert!(events.iter().any(|e| matches!(
        e.event,
        JobEvent::CircuitStateChanged {
            to: CircuitState::Open,
            ..
        }
    )));
}

#[tokio::test]
async fn test_cancel_after_third_batch() {
    let cancel = CancelHandle::new();
    let local = Arc::new(ScriptedLocal {
        cancel_on_call: Some((3, cancel.clone())),
        ..Default::default()
    });
    let (controller, mut rx) = with_channel(controller(small_batch_config(), local.clone()));

    let outcome = controller
        .run(Job::new(OperationType::Sentiment, records(100, 40)), &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert_eq!(outcome.stats.total_batches, 10);
    assert_eq!(outcome.stats.batches_completed, 3);
    assert_eq!(outcome.results.len(), 30);
    assert_eq!(local.calls(), 3);
    assert!(outcome.is_partial());

    let ids: Vec<&str> = outcome.results.iter().map(|r| r.record_id.as_str()).collect();
    assert_eq!(ids.first(), Some(&"r-0"));
    assert_eq!(ids.last(), Some(&"r-29"));

    let events = drain(&mut rx);
    match &events.last().unwrap().event {
        JobEvent::Cancelled {
            items_processed,
            total_items,
            ..
        } => {
            assert_eq!(*items_processed, 30);
            assert_eq!(*total_items, 100);
        }
        other => panic!("expected cancelled event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_progress_is_monotonic_under_concurrency() {
    let local = Arc::new(ScriptedLocal::default());
    let config = small_batch_config().with_max_workers(4);
    let (controller, mut rx) = with_channel(controller(config, local));

    let outcome = controller
        .run(
            Job::new(OperationType::Categorization, records(95, 30)),
            &CancelHandle::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.stats.total_batches, 10);

    let events = drain(&mut rx);
    for (i, envelope) in events.iter().enumerate() {
        assert_eq!(envelope.sequence, i as u64);
        assert_eq!(envelope.job_id, outcome.job_id);
    }
    assert!(matches!(events[0].event, JobEvent::Started { total_items: 95, .. }));

    let progress: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.event {
            JobEvent::Progress(p) => Some(p.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 10);
    for pair in progress.windows(2) {
        assert!(pair[1].items_processed >= pair[0].items_processed);
        assert!(pair[1].progress_percentage >= pair[0].progress_percentage);
    }
    for p in &progress {
        assert!((0.0..=100.0).contains(&p.progress_percentage));
    }
    let last = progress.last().unwrap();
    assert_eq!(last.items_processed, 95);
    assert_eq!(last.progress_percentage, 100.0);

    match &events.last().unwrap().event {
        JobEvent::Complete {
            total_processed,
            succeeded,
            failed,
            ..
        } => {
            assert_eq!(*total_processed, 95);
            assert_eq!(*succeeded, 95);
            assert_eq!(*failed, 0);
        }
        other => panic!("expected complete event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_local_failure_is_fatal_to_its_batch_only() {
    let local = Arc::new(ScriptedLocal {
        fail_on: Some("r-15".into()),
        ..Default::default()
    });
    let (controller, mut rx) = with_channel(controller(small_batch_config(), local));

    let outcome = controller
        .run(
            Job::new(OperationType::Sentiment, records(40, 40)),
            &CancelHandle::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.stats.batches_completed, 4);
    assert_eq!(outcome.stats.succeeded, 30);
    assert_eq!(outcome.stats.failed, 10);
    assert!((outcome.stats.success_rate() - 0.75).abs() < 1e-9);
    assert!(outcome.failures.iter().all(|f| f.batch_index == 1));
    assert!(outcome.is_partial());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e.event,
        JobEvent::Error {
            recoverable: true,
            batch_index: Some(1),
            ..
        }
    )));
}

#[tokio::test]
async fn test_local_panic_is_fatal_to_its_batch_only() {
    let local = Arc::new(ScriptedLocal {
        panic_on: Some("r-25".into()),
        ..Default::default()
    });
    let (controller, mut rx) = with_channel(controller(small_batch_config(), local.clone()));

    let outcome = controller
        .run(
            Job::new(OperationType::Sentiment, records(50, 40)),
            &CancelHandle::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(local.calls(), 5);
    assert_eq!(outcome.stats.batches_completed, 5);
    assert_eq!(outcome.results.len(), 40);
    assert_eq!(outcome.failures.len(), 10);
    assert_eq!(outcome.stats.succeeded + outcome.stats.failed, 50);
    assert!(outcome.failures.iter().all(|f| f.batch_index == 2));
    assert!(outcome
        .failures
        .iter()
        .all(|f| f.reason.contains("scorer crashed")));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e.event,
        JobEvent::Error {
            recoverable: true,
            batch_index: Some(2),
            ..
        }
    )));
    assert!(matches!(
        events.last().unwrap().event,
        JobEvent::Complete { .. }
    ));
}

#[tokio::test]
async fn test_empty_input_aborts_with_unrecoverable_error() {
    let local = Arc::new(ScriptedLocal::default());
    let (controller, mut rx) = with_channel(controller(small_batch_config(), local.clone()));

    let result = controller
        .run(
            Job::new(OperationType::Sentiment, Vec::<Record>::new()),
            &CancelHandle::new(),
        )
        .await;

    assert!(matches!(result, Err(JobError::Plan(_))));
    assert_eq!(local.calls(), 0);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(events[0].event.is_terminal());
}

#[tokio::test]
async fn test_oversized_record_rejected_before_scoring() {
    let local = Arc::new(ScriptedLocal::default());
    let controller = controller(small_batch_config().with_max_record_chars(100), local.clone());

    let mut input = records(20, 40);
    input.push(Record::new("huge", "y".repeat(101)));

    let result = controller
        .run(Job::new(OperationType::Sentiment, input), &CancelHandle::new())
        .await;

    assert!(matches!(result, Err(JobError::Plan(_))));
    assert_eq!(local.calls(), 0);
}

#[tokio::test]
async fn test_cache_serves_repeated_payloads_across_jobs() {
    let local = Arc::new(ScriptedLocal::default());
    let remote = Arc::new(HealthyRemote::default());
    let controller = controller(small_batch_config(), local.clone()).with_remote(remote.clone());

    let first = controller
        .run(
            Job::new(OperationType::Sentiment, records(20, 40)),
            &CancelHandle::new(),
        )
        .await
        .unwrap();
    assert_eq!(first.stats.remote_count, 20);
    assert_eq!(remote.calls.load(Ordering::SeqCst), 2);

    // same payloads under different ids
    let renamed: Vec<Record> = records(20, 40)
        .into_iter()
        .map(|r| Record::new(format!("again-{}", r.id), r.text))
        .collect();
    let second = controller
        .run(
            Job::new(OperationType::Sentiment, renamed),
            &CancelHandle::new(),
        )
        .await
        .unwrap();

    assert_eq!(second.stats.cache_hits, 20);
    assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    assert_eq!(remote.records_seen.load(Ordering::SeqCst), 20);
    assert_eq!(local.calls(), 0);
    assert_eq!(second.results[0].record_id, "again-r-0");
    assert_eq!(second.results[0].source, ScoreSource::Cache);
}

#[tokio::test]
async fn test_cache_does_not_cross_operations() {
    let local = Arc::new(ScriptedLocal::default());
    let remote = Arc::new(OperationEchoRemote::default());
    let controller = controller(small_batch_config(), local).with_remote(remote.clone());

    controller
        .run(
            Job::new(OperationType::Sentiment, records(10, 40)),
            &CancelHandle::new(),
        )
        .await
        .unwrap();
    let summary = controller
        .run(
            Job::new(OperationType::Summarization, records(10, 40)),
            &CancelHandle::new(),
        )
        .await
        .unwrap();

    assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.stats.cache_hits, 0);
    assert!(summary
        .results
        .iter()
        .all(|r| r.category == "summarization"));
}

#[tokio::test]
async fn test_slow_failing_remote_still_opens_breaker() {
    let local = Arc::new(ScriptedLocal::default());
    let remote = Arc::new(SlowDownRemote {
        delay: Duration::from_millis(40),
        calls: AtomicUsize::new(0),
    });
    let config = small_batch_config().with_circuit_failure_window(Duration::from_millis(20));
    let controller = controller(config, local).with_remote(remote.clone());

    let outcome = controller
        .run(
            Job::new(OperationType::Sentiment, records(100, 40)),
            &CancelHandle::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(remote.calls.load(Ordering::SeqCst), 5);
    assert_eq!(controller.breaker().state(), CircuitState::Open);
}

#[tokio::test]
async fn test_same_job_cannot_run_twice_concurrently() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let local = Arc::new(GatedLocal {
        entered: entered.clone(),
        release: release.clone(),
    });
    let controller = Arc::new(controller(small_batch_config(), local));
    let job = Job::new(OperationType::Sentiment, records(5, 40));

    let running = {
        let controller = controller.clone();
        let job = job.clone();
        tokio::spawn(async move { controller.run(job, &CancelHandle::new()).await })
    };
    entered.notified().await;

    let second = controller.run(job.clone(), &CancelHandle::new()).await;
    assert!(matches!(second, Err(JobError::AlreadyRunning(_))));

    release.notify_one();
    let first = running.await.unwrap().unwrap();
    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(first.job_id, job.id());
}

#[tokio::test]
async fn test_throughput_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("history.db");
    let path = db_path.to_str().unwrap();

    {
        let store = Arc::new(SqliteHistoryStore::open(path).await.unwrap());
        let estimator = Arc::new(TimeEstimator::new(50).with_store(store));
        let controller = controller(small_batch_config(), Arc::new(ScriptedLocal::default()))
            .with_estimator(estimator);
        let outcome = controller
            .run(
                Job::new(OperationType::Summarization, records(30, 40)),
                &CancelHandle::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stats.batches_completed, 3);
    }

    let store = Arc::new(SqliteHistoryStore::open(path).await.unwrap());
    assert_eq!(store.count(OperationType::Summarization).await.unwrap(), 3);

    let estimator = TimeEstimator::new(50).with_store(store);
    assert_eq!(
        estimator.hydrate(OperationType::Summarization).await.unwrap(),
        3
    );
    assert_eq!(estimator.sample_count(OperationType::Summarization), 3);
}
