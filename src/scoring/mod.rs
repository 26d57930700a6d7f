//! Scoring collaborators and the structures that protect them.
//!
//! - **RemoteScorer**: the AI-backed scoring service; may be rate limited,
//!   slow or down
//! - **LocalScorer**: the in-process fallback producing the same result shape
//! - **ScoreCache**: content-addressed memo of previous results
//! - **CircuitBreaker**: decides whether the remote scorer is worth calling
//!
//! Scorer calls are folded into a [`ScoreOutcome`] so that the worker pool
//! inspects success, recoverable failure and fatal failure explicitly instead
//! of unwinding through errors.

pub mod cache;
pub mod circuit_breaker;
pub mod lexicon;
pub mod remote;

use async_trait::async_trait;

use crate::error::ScorerError;
use crate::types::{OperationType, Record, ScoreResult};

pub use cache::{CacheConfig, CacheStats, ContentHash, ScoreCache};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState, CircuitTransition,
    TransitionReason,
};
pub use lexicon::LexiconScorer;
pub use remote::HttpRemoteScorer;

/// The remote scoring service.
///
/// Expected failures are `RateLimited`, `Timeout`, `ServiceError` and
/// `Malformed`; all of them are absorbed by falling back to the local scorer.
#[async_trait]
pub trait RemoteScorer: Send + Sync {
    /// Scores `records`, returning one result per record.
    async fn score(
        &self,
        operation: OperationType,
        records: &[Record],
    ) -> Result<Vec<ScoreResult>, ScorerError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "remote"
    }
}

/// The in-process fallback scorer.
///
/// Not expected to fail for well-formed input; a failure is fatal to the
/// batch being scored but not to the job.
#[async_trait]
pub trait LocalScorer: Send + Sync {
    /// Scores `records`, returning one result per record.
    async fn score(
        &self,
        operation: OperationType,
        records: &[Record],
    ) -> Result<Vec<ScoreResult>, ScorerError>;
}

/// Result of one scorer invocation as seen by the worker pool.
#[derive(Debug)]
pub enum ScoreOutcome {
    /// Every requested record was scored.
    Success(Vec<ScoreResult>),
    /// The call failed in a way the local scorer can absorb. Any results
    /// that did come back are kept in `partial`.
    RecoverableFailure {
        error: ScorerError,
        partial: Vec<ScoreResult>,
    },
    /// The call failed and the affected records cannot be scored.
    FatalFailure(ScorerError),
}

impl ScoreOutcome {
    /// Classifies a raw scorer response against the records it was asked for.
    ///
    /// Results for ids that were not requested are dropped. If any requested
    /// id is missing the call counts as malformed; the results that did match
    /// are preserved so only the remainder needs another scorer.
    pub fn classify(
        requested: &[Record],
        response: Result<Vec<ScoreResult>, ScorerError>,
    ) -> Self {
        let results = match response {
            Ok(results) => results,
            Err(error) if error.is_recoverable() => {
                return ScoreOutcome::RecoverableFailure {
                    error,
                    partial: Vec::new(),
                }
            }
            Err(error) => return ScoreOutcome::FatalFailure(error),
        };

        let mut matched: Vec<ScoreResult> = Vec::with_capacity(requested.len());
        let mut seen = std::collections::HashSet::with_capacity(requested.len());
        let wanted: std::collections::HashSet<&str> =
            requested.iter().map(|r| r.id.as_str()).collect();

        for result in results {
            if wanted.contains(result.record_id.as_str()) && seen.insert(result.record_id.clone())
            {
                matched.push(result);
            }
        }

        if matched.len() == requested.len() {
            ScoreOutcome::Success(matched)
        } else {
            let missing = requested.len() - matched.len();
            ScoreOutcome::RecoverableFailure {
                error: ScorerError::Malformed(format!(
                    "{} of {} records missing from response",
                    missing,
                    requested.len()
                )),
                partial: matched,
            }
        }
    }
}
