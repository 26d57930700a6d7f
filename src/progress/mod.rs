//! Progress estimation and reporting.
//!
//! - **TimeEstimator**: rolling throughput history per operation type,
//!   optionally backed by a [`HistoryStore`]
//! - **ProgressReporter**: turns batch completions into a monotonic event
//!   stream and publishes it to [`ProgressSink`]s

pub mod estimator;
pub mod history;
pub mod reporter;
pub mod sink;

pub use estimator::{TimeEstimator, DEFAULT_HISTORY_WINDOW};
pub use history::{HistoryStore, InMemoryHistoryStore, SqliteHistoryStore, ThroughputSample};
pub use reporter::{EventEnvelope, JobEvent, ProgressEvent, ProgressReporter};
pub use sink::{ChannelSink, JsonLinesSink, ProgressSink, TracingSink};
