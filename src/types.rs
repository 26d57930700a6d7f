//! Core data model shared by every stage of a scoring job.
//!
//! - `Record`: immutable free-text feedback plus a stable identifier
//! - `Batch`: a contiguous, zero-copy window over the job's records
//! - `ScoreResult`: per-record sentiment, category and keywords
//! - `RecordFailure`: a record that could not be scored
//! - `OperationType`: the kind of work being timed and estimated

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single feedback record. The engine reads records but never mutates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier supplied by the caller.
    pub id: String,
    /// Free-text payload.
    pub text: String,
}

impl Record {
    /// Creates a new record.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }

    /// Length of the payload in characters (not bytes).
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// An ordered, contiguous slice of the job's records.
///
/// Batches share the job's record storage through an `Arc`, so planning
/// never copies payloads and workers never need a lock to read them.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Zero-based position of this batch in the plan.
    pub batch_index: usize,
    /// Number of batches in the plan this batch belongs to.
    pub total_batches: usize,
    records: Arc<[Record]>,
    range: Range<usize>,
}

impl Batch {
    pub(crate) fn new(
        batch_index: usize,
        total_batches: usize,
        records: Arc<[Record]>,
        range: Range<usize>,
    ) -> Self {
        Self {
            batch_index,
            total_batches,
            records,
            range,
        }
    }

    /// The records covered by this batch.
    pub fn records(&self) -> &[Record] {
        &self.records[self.range.clone()]
    }

    /// Offset of the first record of this batch within the full record set.
    pub fn start(&self) -> usize {
        self.range.start
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Returns true if the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Sentiment label attached to a scored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    /// Maps a score in [-1, 1] to a label using a symmetric dead zone.
    pub fn from_score(score: f64) -> Self {
        if score > 0.05 {
            Sentiment::Positive
        } else if score < -0.05 {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sentiment::Positive => write!(f, "positive"),
            Sentiment::Neutral => write!(f, "neutral"),
            Sentiment::Negative => write!(f, "negative"),
        }
    }
}

/// Which scorer produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Remote,
    Local,
    Cache,
}

impl fmt::Display for ScoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreSource::Remote => write!(f, "remote"),
            ScoreSource::Local => write!(f, "local"),
            ScoreSource::Cache => write!(f, "cache"),
        }
    }
}

/// Scoring output for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Identifier of the scored record.
    pub record_id: String,
    /// Sentiment label.
    pub sentiment: Sentiment,
    /// Sentiment score in [-1, 1].
    pub score: f64,
    /// Extracted category.
    pub category: String,
    /// Extracted keywords, most relevant first.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Which path produced this result. Scorers may omit it on the wire.
    #[serde(default = "default_source")]
    pub source: ScoreSource,
}

fn default_source() -> ScoreSource {
    ScoreSource::Remote
}

impl ScoreResult {
    /// Creates a result with no keywords, attributed to the local scorer.
    pub fn new(record_id: impl Into<String>, score: f64, category: impl Into<String>) -> Self {
        let score = score.clamp(-1.0, 1.0);
        Self {
            record_id: record_id.into(),
            sentiment: Sentiment::from_score(score),
            score,
            category: category.into(),
            keywords: Vec::new(),
            source: ScoreSource::Local,
        }
    }

    /// Sets the keywords.
    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    /// Sets the producing source.
    pub fn with_source(mut self, source: ScoreSource) -> Self {
        self.source = source;
        self
    }
}

/// A record that could not be scored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub record_id: String,
    pub batch_index: usize,
    pub reason: String,
}

/// Kind of work performed by a job, used to key throughput history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Sentiment,
    Categorization,
    Summarization,
}

impl OperationType {
    /// Stable string form used for storage keys and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Sentiment => "sentiment",
            OperationType::Categorization => "categorization",
            OperationType::Summarization => "summarization",
        }
    }

    /// Per-record duration assumed when no throughput history exists.
    pub fn default_per_record(&self) -> Duration {
        match self {
            OperationType::Sentiment => Duration::from_millis(50),
            OperationType::Categorization => Duration::from_millis(30),
            OperationType::Summarization => Duration::from_millis(120),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sentiment" => Ok(OperationType::Sentiment),
            "categorization" | "categorize" => Ok(OperationType::Categorization),
            "summarization" | "summarize" => Ok(OperationType::Summarization),
            other => Err(format!("unknown operation type '{}'", other)),
        }
    }
}
