//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by feedback_forge and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use parking_lot::Mutex;
use std::sync::OnceLock;

/// Serializes initialization so the statics always come from one registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all feedback_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Completed batches, labeled by status (`ok`, `degraded`, `failed`).
pub static BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Scored records, labeled by path (`remote`, `local`, `cache`, `failed`).
pub static RECORDS_SCORED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Remote scorer call latency in seconds.
pub static REMOTE_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Circuit breaker state: 0 closed, 1 half-open, 2 open.
pub static CIRCUIT_STATE: OnceLock<Gauge> = OnceLock::new();

/// Number of workers currently scoring a batch.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Last observed available memory in megabytes.
pub static AVAILABLE_MEMORY_MB: OnceLock<Gauge> = OnceLock::new();

/// Finished jobs, labeled by terminal status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once is harmless: later calls return early.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock();
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let batches_total = CounterVec::new(
        Opts::new("feedback_forge_batches_total", "Total number of batches processed"),
        &["status"],
    )?;

    let records_scored_total = CounterVec::new(
        Opts::new(
            "feedback_forge_records_scored_total",
            "Total records scored, by scoring path",
        ),
        &["path"],
    )?;

    let remote_latency = Histogram::with_opts(
        HistogramOpts::new(
            "feedback_forge_remote_latency_seconds",
            "Remote scorer call latency in seconds",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )?;

    let circuit_state = Gauge::new(
        "feedback_forge_circuit_state",
        "Circuit breaker state (0 closed, 1 half-open, 2 open)",
    )?;

    let active_workers = Gauge::new(
        "feedback_forge_active_workers",
        "Number of workers currently scoring a batch",
    )?;

    let available_memory_mb = Gauge::new(
        "feedback_forge_available_memory_mb",
        "Last observed available memory in megabytes",
    )?;

    let jobs_total = CounterVec::new(
        Opts::new("feedback_forge_jobs_total", "Total jobs finished, by status"),
        &["status"],
    )?;

    registry.register(Box::new(batches_total.clone()))?;
    registry.register(Box::new(records_scored_total.clone()))?;
    registry.register(Box::new(remote_latency.clone()))?;
    registry.register(Box::new(circuit_state.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(available_memory_mb.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;

    // Registry last: its presence marks initialization as complete
    let _ = BATCHES_TOTAL.set(batches_total);
    let _ = RECORDS_SCORED_TOTAL.set(records_scored_total);
    let _ = REMOTE_LATENCY.set(remote_latency);
    let _ = CIRCUIT_STATE.set(circuit_state);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = AVAILABLE_MEMORY_MB.set(available_memory_mb);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = REGISTRY.set(registry);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem instead.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
