//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks batch outcomes, scoring paths, remote latency, circuit state,
//! worker activity and memory readings.
//!
//! # Example
//!
//! ```ignore
//! use feedback_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("completed");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, AVAILABLE_MEMORY_MB, BATCHES_TOTAL, CIRCUIT_STATE, JOBS_TOTAL,
    RECORDS_SCORED_TOTAL, REGISTRY, REMOTE_LATENCY,
};
