//! Job orchestration.
//!
//! # Architecture
//!
//! - **Config**: every engine tunable, loadable from `FEEDBACK_*` variables
//! - **Controller**: composes planner, worker pool, breaker, cache,
//!   estimator and reporter into one run over a record set
//!
//! # Job Flow
//!
//! 1. **Estimate**: the throughput history predicts the job's duration
//! 2. **Plan**: records are cut into memory-aware batches
//! 3. **Score**: the worker pool scores batches concurrently, consulting the
//!    cache and the circuit breaker before calling the remote scorer
//! 4. **Report**: each finished batch updates the throughput history and
//!    publishes a progress event
//! 5. **Finish**: one terminal event (`complete`, `cancelled` or an
//!    unrecoverable `error`) and a [`JobOutcome`] with all results so far
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use feedback_forge::pipeline::{BatchJobController, CancelHandle, EngineConfig, Job};
//! use feedback_forge::scoring::LexiconScorer;
//! use feedback_forge::types::OperationType;
//!
//! let controller = BatchJobController::new(EngineConfig::from_env()?, Arc::new(LexiconScorer::new()))?;
//! let job = Job::new(OperationType::Sentiment, records);
//! let outcome = controller.run(job, &CancelHandle::new()).await?;
//!
//! println!("{}: {} scored, {} failed", outcome.status, outcome.stats.succeeded, outcome.stats.failed);
//! ```

pub mod config;
pub mod controller;

pub use config::EngineConfig;
pub use controller::{BatchJobController, CancelHandle, Job, JobOutcome, JobStats, JobStatus};
