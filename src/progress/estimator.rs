//! Throughput-based duration estimates.
//!
//! `estimate(op, n) = n * sum(elapsed) / sum(record_count)` over the most
//! recent samples for `op`, or `n * op.default_per_record()` when there is
//! no usable history.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::history::{HistoryStore, ThroughputSample};
use crate::error::HistoryError;
use crate::types::OperationType;

/// Default number of samples kept per operation.
pub const DEFAULT_HISTORY_WINDOW: usize = 200;

/// Rolling per-operation throughput history shared by all jobs of a process.
pub struct TimeEstimator {
    window: usize,
    history: Mutex<HashMap<OperationType, VecDeque<ThroughputSample>>>,
    store: Option<Arc<dyn HistoryStore>>,
    /// Operations already loaded from the store.
    hydrated: Mutex<HashSet<OperationType>>,
}

impl Default for TimeEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_WINDOW)
    }
}

impl TimeEstimator {
    /// Creates an in-memory estimator keeping `window` samples per operation.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            history: Mutex::new(HashMap::new()),
            store: None,
            hydrated: Mutex::new(HashSet::new()),
        }
    }

    /// Persists samples to `store` in addition to the in-memory window.
    pub fn with_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Samples kept per operation.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Loads recent samples for `operation` from the durable store.
    ///
    /// Loaded samples are placed before any already held in memory. Each
    /// operation is loaded at most once. Returns the number of samples loaded
    /// (zero without a store).
    pub async fn hydrate(&self, operation: OperationType) -> Result<usize, HistoryError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };
        if self.hydrated.lock().contains(&operation) {
            return Ok(0);
        }
        let loaded = store.recent(operation, self.window).await?;
        self.hydrated.lock().insert(operation);
        let count = loaded.len();

        let mut history = self.history.lock();
        let entry = history.entry(operation).or_default();
        let existing: Vec<ThroughputSample> = entry.drain(..).collect();
        entry.extend(loaded);
        entry.extend(existing);
        while entry.len() > self.window {
            entry.pop_front();
        }

        debug!(operation = %operation, samples = count, "Hydrated throughput history");
        Ok(count)
    }

    /// Appends a sample to the in-memory window and returns it.
    ///
    /// Samples covering zero records carry no throughput information and are
    /// ignored.
    pub fn record(
        &self,
        operation: OperationType,
        record_count: usize,
        elapsed: Duration,
    ) -> Option<ThroughputSample> {
        if record_count == 0 {
            return None;
        }
        let sample = ThroughputSample::new(operation, record_count, elapsed);

        let mut history = self.history.lock();
        let entry = history.entry(operation).or_default();
        entry.push_back(sample.clone());
        while entry.len() > self.window {
            entry.pop_front();
        }
        Some(sample)
    }

    /// Records a sample and appends it to the durable store, if any.
    ///
    /// A store failure is logged and otherwise ignored; estimates keep
    /// working from memory.
    pub async fn record_and_persist(
        &self,
        operation: OperationType,
        record_count: usize,
        elapsed: Duration,
    ) {
        let Some(sample) = self.record(operation, record_count, elapsed) else {
            return;
        };
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.append(&sample).await {
                warn!(operation = %operation, error = %e, "Failed to persist throughput sample");
            }
        }
    }

    /// Mean time per record for `operation`.
    pub fn per_record(&self, operation: OperationType) -> Duration {
        let history = self.history.lock();
        let Some(samples) = history.get(&operation) else {
            return operation.default_per_record();
        };

        let total_records: usize = samples.iter().map(|s| s.record_count).sum();
        if total_records == 0 {
            return operation.default_per_record();
        }
        let total_nanos: u128 = samples.iter().map(|s| s.elapsed.as_nanos()).sum();
        nanos_to_duration(total_nanos / total_records as u128)
    }

    /// Predicted time to process `record_count` records of `operation`.
    pub fn estimate(&self, operation: OperationType, record_count: usize) -> Duration {
        let per_record = self.per_record(operation).as_nanos();
        nanos_to_duration(per_record.saturating_mul(record_count as u128))
    }

    /// Number of samples held for `operation`.
    pub fn sample_count(&self, operation: OperationType) -> usize {
        self.history
            .lock()
            .get(&operation)
            .map_or(0, VecDeque::len)
    }
}

fn nanos_to_duration(nanos: u128) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::history::InMemoryHistoryStore;

    #[test]
    fn test_falls_back_to_default() {
        let estimator = TimeEstimator::default();
        assert_eq!(
            estimator.estimate(OperationType::Sentiment, 100),
            OperationType::Sentiment.default_per_record() * 100
        );
        assert_eq!(estimator.estimate(OperationType::Sentiment, 0), Duration::ZERO);
    }

    #[test]
    fn test_uses_throughput_ratio() {
        let estimator = TimeEstimator::new(10);
        estimator.record(OperationType::Sentiment, 100, Duration::from_secs(2));
        estimator.record(OperationType::Sentiment, 300, Duration::from_secs(2));

        // 4s over 400 records = 10ms per record
        assert_eq!(
            estimator.estimate(OperationType::Sentiment, 1000),
            Duration::from_secs(10)
        );

        // other operations are unaffected
        assert_eq!(
            estimator.estimate(OperationType::Summarization, 10),
            OperationType::Summarization.default_per_record() * 10
        );
    }

    #[test]
    fn test_estimate_is_idempotent() {
        let estimator = TimeEstimator::new(10);
        estimator.record(OperationType::Categorization, 50, Duration::from_millis(700));
        let first = estimator.estimate(OperationType::Categorization, 123);
        let second = estimator.estimate(OperationType::Categorization, 123);
        assert_eq!(first, second);
    }

    #[test]
    fn test_faster_samples_lower_estimate() {
        let estimator = TimeEstimator::new(10);
        estimator.record(OperationType::Sentiment, 100, Duration::from_secs(10));
        let before = estimator.estimate(OperationType::Sentiment, 100);

        estimator.record(OperationType::Sentiment, 100, Duration::from_secs(1));
        let after = estimator.estimate(OperationType::Sentiment, 100);
        assert!(after < before);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let estimator = TimeEstimator::new(2);
        estimator.record(OperationType::Sentiment, 10, Duration::from_secs(100));
        estimator.record(OperationType::Sentiment, 10, Duration::from_secs(1));
        estimator.record(OperationType::Sentiment, 10, Duration::from_secs(1));

        assert_eq!(estimator.sample_count(OperationType::Sentiment), 2);
        assert_eq!(
            estimator.per_record(OperationType::Sentiment),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_zero_record_samples_ignored() {
        let estimator = TimeEstimator::new(5);
        assert!(estimator
            .record(OperationType::Sentiment, 0, Duration::from_secs(5))
            .is_none());
        assert_eq!(estimator.sample_count(OperationType::Sentiment), 0);
    }

    #[tokio::test]
    async fn test_persist_and_hydrate() {
        let store = Arc::new(InMemoryHistoryStore::new());

        let first = TimeEstimator::new(10).with_store(store.clone());
        first
            .record_and_persist(OperationType::Sentiment, 100, Duration::from_secs(1))
            .await;
        assert_eq!(store.len(), 1);

        let second = TimeEstimator::new(10).with_store(store);
        assert_eq!(second.sample_count(OperationType::Sentiment), 0);
        let loaded = second.hydrate(OperationType::Sentiment).await.unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(second.hydrate(OperationType::Sentiment).await.unwrap(), 0);
        assert_eq!(
            second.per_record(OperationType::Sentiment),
            Duration::from_millis(10)
        );
    }

    #[tokio::test]
    async fn test_hydrate_without_store() {
        let estimator = TimeEstimator::new(10);
        assert_eq!(estimator.hydrate(OperationType::Sentiment).await.unwrap(), 0);
    }
}
