//! feedback-forge: batch processing and resilience engine for scoring
//! customer feedback.
//!
//! Records are cut into memory-aware batches, scored concurrently by a
//! remote service guarded by a circuit breaker and a content cache, with a
//! local scorer as fallback. Progress and time-to-completion estimates are
//! streamed to pluggable sinks.

pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod scheduler;
pub mod scoring;
pub mod types;

// Re-export commonly used types
pub use error::{ConfigError, HistoryError, JobError, PlanError, ScorerError, SinkError};
pub use pipeline::{BatchJobController, CancelHandle, EngineConfig, Job, JobOutcome, JobStatus};
pub use types::{OperationType, Record, ScoreResult};
