//! Durable backing for throughput history.
//!
//! The estimator works fine with no store at all; a store only lets
//! estimates survive process restarts.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::error::HistoryError;
use crate::types::OperationType;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS throughput_samples (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    operation       TEXT    NOT NULL,
    record_count    INTEGER NOT NULL,
    elapsed_secs    REAL    NOT NULL,
    recorded_at     TEXT    NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_throughput_operation ON throughput_samples(operation, id);
"#;

/// One observed (work, time) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub operation: OperationType,
    pub record_count: usize,
    pub elapsed: Duration,
    pub recorded_at: DateTime<Utc>,
}

impl ThroughputSample {
    /// Creates a sample stamped with the current time.
    pub fn new(operation: OperationType, record_count: usize, elapsed: Duration) -> Self {
        Self {
            operation,
            record_count,
            elapsed,
            recorded_at: Utc::now(),
        }
    }
}

/// Persistent storage for throughput samples.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Appends a sample.
    async fn append(&self, sample: &ThroughputSample) -> Result<(), HistoryError>;

    /// Returns up to `limit` most recent samples for `operation`, oldest first.
    async fn recent(
        &self,
        operation: OperationType,
        limit: usize,
    ) -> Result<Vec<ThroughputSample>, HistoryError>;
}

/// Process-lifetime store, mainly for tests and embedding.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    samples: Mutex<HashMap<OperationType, VecDeque<ThroughputSample>>>,
    capacity: Option<usize>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` samples per operation.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    /// Total samples held across operations.
    pub fn len(&self) -> usize {
        self.samples.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, sample: &ThroughputSample) -> Result<(), HistoryError> {
        let mut samples = self.samples.lock();
        let history = samples.entry(sample.operation).or_default();
        history.push_back(sample.clone());
        if let Some(capacity) = self.capacity {
            while history.len() > capacity {
                history.pop_front();
            }
        }
        Ok(())
    }

    async fn recent(
        &self,
        operation: OperationType,
        limit: usize,
    ) -> Result<Vec<ThroughputSample>, HistoryError> {
        let samples = self.samples.lock();
        let Some(history) = samples.get(&operation) else {
            return Ok(Vec::new());
        };
        let skip = history.len().saturating_sub(limit);
        Ok(history.iter().skip(skip).cloned().collect())
    }
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    /// Opens (creating if needed) the database at `path`.
    pub async fn open(path: &str) -> Result<Self, HistoryError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(path = path, "Throughput history opened");
        Ok(Self { pool })
    }

    /// Number of stored samples for `operation`.
    pub async fn count(&self, operation: OperationType) -> Result<u64, HistoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM throughput_samples WHERE operation = ?1")
            .bind(operation.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, sample: &ThroughputSample) -> Result<(), HistoryError> {
        sqlx::query(
            "INSERT INTO throughput_samples (operation, record_count, elapsed_secs, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(sample.operation.as_str())
        .bind(sample.record_count as i64)
        .bind(sample.elapsed.as_secs_f64())
        .bind(sample.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(
        &self,
        operation: OperationType,
        limit: usize,
    ) -> Result<Vec<ThroughputSample>, HistoryError> {
        let rows = sqlx::query(
            "SELECT record_count, elapsed_secs, recorded_at FROM throughput_samples
             WHERE operation = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(operation.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut samples = rows
            .into_iter()
            .map(|row| {
                let record_count: i64 = row.get("record_count");
                let elapsed_secs: f64 = row.get("elapsed_secs");
                let recorded_at: String = row.get("recorded_at");

                if record_count < 0 || !elapsed_secs.is_finite() || elapsed_secs < 0.0 {
                    return Err(HistoryError::Serialization(format!(
                        "invalid sample ({} records, {}s)",
                        record_count, elapsed_secs
                    )));
                }
                let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| HistoryError::Serialization(e.to_string()))?;

                Ok(ThroughputSample {
                    operation,
                    record_count: record_count as usize,
                    elapsed: Duration::from_secs_f64(elapsed_secs),
                    recorded_at,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        samples.reverse();
        Ok(samples)
    }
}
