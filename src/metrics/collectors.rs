//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op for metrics that have not been initialized, so
//! library users and tests never need to call `init_metrics()`.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, AVAILABLE_MEMORY_MB, BATCHES_TOTAL, CIRCUIT_STATE, JOBS_TOTAL,
    RECORDS_SCORED_TOTAL, REMOTE_LATENCY,
};
use crate::scoring::CircuitState;

/// Metrics collector for recording engine operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished batch.
    ///
    /// # Arguments
    ///
    /// * `status` - `ok`, `degraded` (fell back locally) or `failed`
    /// * `remote`, `local`, `cache`, `failed` - record counts per path
    pub fn record_batch(
        &self,
        status: &str,
        remote: usize,
        local: usize,
        cache: usize,
        failed: usize,
    ) {
        if let Some(batches) = BATCHES_TOTAL.get() {
            batches.with_label_values(&[status]).inc();
        }

        if let Some(records) = RECORDS_SCORED_TOTAL.get() {
            let paths = [
                ("remote", remote),
                ("local", local),
                ("cache", cache),
                ("failed", failed),
            ];
            for (path, count) in paths {
                if count > 0 {
                    records.with_label_values(&[path]).inc_by(count as f64);
                }
            }
        }

        tracing::trace!(
            status = status,
            remote = remote,
            local = local,
            cache = cache,
            failed = failed,
            "Recorded batch metric"
        );
    }

    /// Record a remote scorer call latency.
    pub fn record_remote_latency(&self, elapsed: Duration) {
        if let Some(latency) = REMOTE_LATENCY.get() {
            latency.observe(elapsed.as_secs_f64());
        }
    }

    /// Update the circuit state gauge.
    pub fn record_circuit_state(&self, state: CircuitState) {
        if let Some(gauge) = CIRCUIT_STATE.get() {
            gauge.set(state.as_gauge());
        }

        tracing::trace!(state = %state, "Recorded circuit state metric");
    }

    /// Mark a worker as busy.
    pub fn worker_started(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    /// Mark a worker as idle.
    pub fn worker_finished(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }

    /// Record the latest available-memory reading.
    pub fn record_available_memory(&self, mb: f64) {
        if let Some(gauge) = AVAILABLE_MEMORY_MB.get() {
            gauge.set(mb);
        }
    }

    /// Record a job reaching a terminal status.
    pub fn record_job(&self, status: &str) {
        if let Some(jobs) = JOBS_TOTAL.get() {
            jobs.with_label_values(&[status]).inc();
        }

        tracing::trace!(status = status, "Recorded job metric");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_collector_is_noop_safe() {
        // must not panic whether or not metrics are initialized
        let collector = MetricsCollector::new();
        collector.record_batch("ok", 1, 2, 3, 0);
        collector.record_remote_latency(Duration::from_millis(250));
        collector.record_circuit_state(CircuitState::Open);
        collector.worker_started();
        collector.worker_finished();
        collector.record_available_memory(512.0);
        collector.record_job("completed");
    }

    #[test]
    fn test_recorded_values_exported() {
        init_metrics().expect("init metrics");
        let collector = MetricsCollector::new();
        collector.record_batch("degraded", 0, 10, 2, 0);
        collector.record_circuit_state(CircuitState::HalfOpen);

        let text = export_metrics();
        assert!(text.contains("feedback_forge_batches_total"));
        assert!(text.contains("feedback_forge_records_scored_total"));
        assert!(text.contains("feedback_forge_circuit_state"));
    }
}
