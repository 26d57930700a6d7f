//! Error types for feedback-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Remote and local scorer calls
//! - Batch planning and input validation
//! - Configuration loading
//! - Throughput history persistence
//! - Event sinks
//! - Job orchestration

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a scorer collaborator.
///
/// Remote variants are transient: the worker pool records them against the
/// circuit breaker and falls back to the local scorer within the same batch.
#[derive(Debug, Clone, Error)]
pub enum ScorerError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Scorer timed out after {0:?}")]
    Timeout(Duration),

    #[error("Service error ({code}): {message}")]
    ServiceError { code: u16, message: String },

    #[error("Malformed scorer response: {0}")]
    Malformed(String),

    #[error("Local scorer failed: {0}")]
    LocalFailure(String),
}

impl ScorerError {
    /// Whether the failure can be absorbed by falling back to the local scorer.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ScorerError::LocalFailure(_))
    }
}

/// Errors that abort a job before any batch runs.
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    #[error("No records to process")]
    EmptyInput,

    #[error("Invalid planner configuration: {0}")]
    InvalidConfig(String),

    #[error("Record '{record_id}' rejected: {reason}")]
    RecordRejected { record_id: String, reason: String },
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Errors from the durable throughput history.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from publishing job events to a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the job controller.
///
/// Scorer failures never appear here; they are absorbed per batch and
/// reflected in the job's statistics instead.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job {0} has already been started")]
    AlreadyRunning(String),
}
