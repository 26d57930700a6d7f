//! Batch planning.
//!
//! Splits a record set into contiguous batches whose size shrinks as records
//! get longer and as available memory gets scarcer:
//!
//! | Average length | Base size |
//! |----------------|-----------|
//! | < 100 chars    | 500       |
//! | < 200 chars    | 300       |
//! | < 500 chars    | 200       |
//! | otherwise      | 150       |
//!
//! The base size is multiplied by `min(1, available_mb / memory_reference_mb)`
//! and by the caller's multiplier, then floored at `min_batch_size`.

pub mod memory;

use std::sync::Arc;

use tracing::debug;

use crate::error::PlanError;
use crate::types::{Batch, Record};

pub use memory::{FixedMemoryProbe, MemoryMonitor, MemoryProbe, SystemMemoryProbe};

/// Configuration for the batch planner.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Caller-configurable scale applied to the computed batch size.
    pub batch_size_multiplier: f64,
    /// Smallest batch the planner will produce (except for a short tail).
    pub min_batch_size: usize,
    /// Available memory at or above which no memory scaling is applied.
    pub memory_reference_mb: f64,
    /// Records longer than this are rejected before any work starts.
    pub max_record_chars: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            batch_size_multiplier: 1.0,
            min_batch_size: 50,
            memory_reference_mb: 1000.0,
            max_record_chars: 100_000,
        }
    }
}

impl PlannerConfig {
    /// Sets the batch size multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.batch_size_multiplier = multiplier;
        self
    }

    /// Sets the minimum batch size.
    pub fn with_min_batch_size(mut self, size: usize) -> Self {
        self.min_batch_size = size;
        self
    }

    /// Sets the memory reference point.
    pub fn with_memory_reference_mb(mut self, mb: f64) -> Self {
        self.memory_reference_mb = mb;
        self
    }

    /// Sets the maximum accepted record length.
    pub fn with_max_record_chars(mut self, chars: usize) -> Self {
        self.max_record_chars = chars;
        self
    }

    /// Checks that the configuration can produce a plan.
    pub fn validate(&self) -> Result<(), PlanError> {
        if !self.batch_size_multiplier.is_finite() || self.batch_size_multiplier <= 0.0 {
            return Err(PlanError::InvalidConfig(format!(
                "batch size multiplier must be a positive number, got {}",
                self.batch_size_multiplier
            )));
        }
        if self.min_batch_size == 0 {
            return Err(PlanError::InvalidConfig(
                "minimum batch size must be at least 1".to_string(),
            ));
        }
        if !self.memory_reference_mb.is_finite() || self.memory_reference_mb <= 0.0 {
            return Err(PlanError::InvalidConfig(format!(
                "memory reference must be a positive number, got {}",
                self.memory_reference_mb
            )));
        }
        Ok(())
    }
}

/// Base batch size for an average record length, before any scaling.
pub fn base_batch_size(avg_length: f64) -> usize {
    if avg_length < 100.0 {
        500
    } else if avg_length < 200.0 {
        300
    } else if avg_length < 500.0 {
        200
    } else {
        150
    }
}

/// Computes the batch size for the given statistics.
///
/// Non-increasing in `avg_length` and non-decreasing in `available_mb`.
pub fn compute_batch_size(avg_length: f64, available_mb: f64, config: &PlannerConfig) -> usize {
    let memory_factor = (available_mb.max(0.0) / config.memory_reference_mb).min(1.0);
    let scaled =
        base_batch_size(avg_length) as f64 * memory_factor * config.batch_size_multiplier;
    (scaled.floor() as usize).max(config.min_batch_size)
}

/// Plans batches for a record set.
pub struct BatchPlanner {
    config: PlannerConfig,
    memory: Arc<MemoryMonitor>,
}

impl BatchPlanner {
    /// Creates a planner reading memory from `memory`.
    pub fn new(config: PlannerConfig, memory: Arc<MemoryMonitor>) -> Self {
        Self { config, memory }
    }

    /// Returns the planner configuration.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Validates the records and returns the batch size that would be used.
    pub fn batch_size(&self, records: &[Record]) -> Result<usize, PlanError> {
        self.config.validate()?;
        let avg_length = self.average_length(records)?;
        let available_mb = self.memory.available_mb();
        let size = compute_batch_size(avg_length, available_mb, &self.config);

        debug!(
            records = records.len(),
            avg_length = avg_length,
            available_mb = available_mb,
            batch_size = size,
            "Computed batch size"
        );

        Ok(size)
    }

    /// Partitions `records` into contiguous batches.
    ///
    /// The batches cover every record exactly once, in order; only the last
    /// batch may be shorter than the computed size.
    pub fn plan(&self, records: Arc<[Record]>) -> Result<Vec<Batch>, PlanError> {
        let size = self.batch_size(&records)?;
        let total = records.len();
        let total_batches = total.div_ceil(size);

        let batches = (0..total_batches)
            .map(|index| {
                let start = index * size;
                let end = (start + size).min(total);
                Batch::new(index, total_batches, Arc::clone(&records), start..end)
            })
            .collect();

        Ok(batches)
    }

    /// Mean payload length in characters, validating each record on the way.
    fn average_length(&self, records: &[Record]) -> Result<f64, PlanError> {
        if records.is_empty() {
            return Err(PlanError::EmptyInput);
        }

        let mut total_chars = 0usize;
        for record in records {
            if record.id.trim().is_empty() {
                return Err(PlanError::RecordRejected {
                    record_id: record.id.clone(),
                    reason: "record identifier is empty".to_string(),
                });
            }
            let len = record.char_len();
            if len > self.config.max_record_chars {
                return Err(PlanError::RecordRejected {
                    record_id: record.id.clone(),
                    reason: format!(
                        "payload of {} chars exceeds the {} char limit",
                        len, self.config.max_record_chars
                    ),
                });
            }
            total_chars += len;
        }

        Ok(total_chars as f64 / records.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records_of_length(count: usize, len: usize) -> Arc<[Record]> {
        (0..count)
            .map(|i| Record::new(format!("r{}", i), "x".repeat(len)))
            .collect::<Vec<_>>()
            .into()
    }

    fn planner(mb: f64, config: PlannerConfig) -> BatchPlanner {
        BatchPlanner::new(config, Arc::new(MemoryMonitor::fixed(mb)))
    }

    #[test]
    fn test_short_records_abundant_memory() {
        let planner = planner(8000.0, PlannerConfig::default());
        let batches = planner.plan(records_of_length(1000, 80)).expect("plan");

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 500);
        assert_eq!(batches[1].len(), 500);
        assert_eq!(batches[0].total_batches, 2);
    }

    #[test]
    fn test_multiplier_scales_size() {
        let planner = planner(8000.0, PlannerConfig::default().with_multiplier(0.5));
        let batches = planner.plan(records_of_length(1000, 80)).expect("plan");

        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.len() == 250));
    }

    #[test]
    fn test_length_tiers() {
        let config = PlannerConfig::default();
        assert_eq!(compute_batch_size(99.0, 2000.0, &config), 500);
        assert_eq!(compute_batch_size(150.0, 2000.0, &config), 300);
        assert_eq!(compute_batch_size(499.0, 2000.0, &config), 200);
        assert_eq!(compute_batch_size(5000.0, 2000.0, &config), 150);
    }

    #[test]
    fn test_memory_scaling_and_floor() {
        let config = PlannerConfig::default();
        assert_eq!(compute_batch_size(50.0, 500.0, &config), 250);
        assert_eq!(compute_batch_size(50.0, 50.0, &config), 50);
        assert_eq!(compute_batch_size(50.0, 0.0, &config), 50);
    }

    #[test]
    fn test_size_non_increasing_in_length() {
        let config = PlannerConfig::default();
        for mb in [0.0, 100.0, 400.0, 999.0, 4000.0] {
            let mut previous = usize::MAX;
            for len in (0..2000).step_by(7) {
                let size = compute_batch_size(len as f64, mb, &config);
                assert!(size <= previous, "len={} mb={}", len, mb);
                previous = size;
            }
        }
    }

    #[test]
    fn test_size_non_increasing_as_memory_drops() {
        let config = PlannerConfig::default();
        for len in [10.0, 150.0, 300.0, 800.0] {
            let mut previous = usize::MAX;
            for mb in (0..3000).rev().step_by(13) {
                let size = compute_batch_size(len, mb as f64, &config);
                assert!(size <= previous, "len={} mb={}", len, mb);
                previous = size;
            }
        }
    }

    #[test]
    fn test_batches_partition_records() {
        for (count, len, mb) in [(1, 10, 100.0), (49, 10, 9000.0), (1234, 250, 300.0), (777, 600, 2000.0)] {
            let planner = planner(mb, PlannerConfig::default());
            let records = records_of_length(count, len);
            let batches = planner.plan(Arc::clone(&records)).expect("plan");

            let total: usize = batches.iter().map(Batch::len).sum();
            assert_eq!(total, count);

            let mut expected_start = 0;
            for (i, batch) in batches.iter().enumerate() {
                assert_eq!(batch.batch_index, i);
                assert_eq!(batch.total_batches, batches.len());
                assert_eq!(batch.start(), expected_start);
                assert!(!batch.is_empty());
                expected_start += batch.len();
            }
        }
    }

    #[test]
    fn test_empty_input_rejected() {
        let planner = planner(1000.0, PlannerConfig::default());
        let empty: Arc<[Record]> = Vec::new().into();
        assert!(matches!(planner.plan(empty), Err(PlanError::EmptyInput)));
    }

    #[test]
    fn test_invalid_multiplier_rejected() {
        for multiplier in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let planner = planner(1000.0, PlannerConfig::default().with_multiplier(multiplier));
            assert!(matches!(
                planner.plan(records_of_length(10, 10)),
                Err(PlanError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_oversized_record_rejected() {
        let planner = planner(1000.0, PlannerConfig::default().with_max_record_chars(20));
        let mut records: Vec<Record> = records_of_length(3, 10).to_vec();
        records.push(Record::new("huge", "y".repeat(21)));

        match planner.plan(records.into()) {
            Err(PlanError::RecordRejected { record_id, .. }) => assert_eq!(record_id, "huge"),
            other => panic!("expected rejection, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_blank_id_rejected() {
        let planner = planner(1000.0, PlannerConfig::default());
        let records: Arc<[Record]> = vec![Record::new("  ", "hello")].into();
        assert!(matches!(
            planner.plan(records),
            Err(PlanError::RecordRejected { .. })
        ));
    }
}
