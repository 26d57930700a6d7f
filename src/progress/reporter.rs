//! Job event sequencing.
//!
//! The reporter is owned by the single task that consumes the worker pool's
//! output, so it needs no locking. It keeps a global count of completed
//! items: batches may finish in any order, but every item is counted once
//! and `items_processed` never goes backwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::sink::ProgressSink;
use crate::scoring::{CircuitState, CircuitTransition, TransitionReason};

/// Serializes a `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Progress after one batch completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub batch_index: usize,
    pub total_batches: usize,
    pub items_processed: usize,
    pub total_items: usize,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    /// Items per second since the job started.
    pub average_speed: f64,
    #[serde(with = "duration_secs")]
    pub estimated_time_remaining: Duration,
    /// `100 * items_processed / total_items`, clamped to [0, 100].
    pub progress_percentage: f64,
}

/// Everything a job tells its observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Emitted once before any batch runs.
    Started {
        total_items: usize,
        total_batches: usize,
        #[serde(with = "duration_secs")]
        estimated_duration: Duration,
    },
    Progress(ProgressEvent),
    CircuitStateChanged {
        from: CircuitState,
        to: CircuitState,
        reason: TransitionReason,
        message: String,
    },
    Error {
        message: String,
        /// False when the job was aborted.
        recoverable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_index: Option<usize>,
    },
    Complete {
        total_processed: usize,
        succeeded: usize,
        failed: usize,
        #[serde(with = "duration_secs")]
        total_time: Duration,
        average_speed: f64,
    },
    Cancelled {
        items_processed: usize,
        total_items: usize,
        #[serde(with = "duration_secs")]
        elapsed: Duration,
    },
}

impl JobEvent {
    /// Whether this event ends the job's event stream.
    pub fn is_terminal(&self) -> bool {
        match self {
            JobEvent::Complete { .. } | JobEvent::Cancelled { .. } => true,
            JobEvent::Error { recoverable, .. } => !recoverable,
            _ => false,
        }
    }

    /// Builds the user-facing notification for a breaker transition.
    pub fn from_transition(transition: &CircuitTransition) -> Self {
        let message = match transition.to {
            CircuitState::Open => format!(
                "Remote scoring paused ({}); using local scorer",
                transition.reason
            ),
            CircuitState::HalfOpen => "Probing remote scorer".to_string(),
            CircuitState::Closed => "Remote scoring resumed".to_string(),
        };
        JobEvent::CircuitStateChanged {
            from: transition.from,
            to: transition.to,
            reason: transition.reason.clone(),
            message,
        }
    }
}

/// A job event addressed to one job, with its position in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub job_id: Uuid,
    /// Zero-based, increments by one per event of this job.
    pub sequence: u64,
    #[serde(flatten)]
    pub event: JobEvent,
}

/// Sequences progress for one job and publishes events to every sink.
pub struct ProgressReporter {
    job_id: Uuid,
    total_items: usize,
    total_batches: usize,
    started: Instant,
    items_processed: usize,
    last_percentage: f64,
    sequence: u64,
    sinks: Vec<Arc<dyn ProgressSink>>,
    publish_timeout: Duration,
}

impl ProgressReporter {
    /// Creates a reporter for a job of `total_items` records in `total_batches`.
    pub fn new(
        job_id: Uuid,
        total_items: usize,
        total_batches: usize,
        sinks: Vec<Arc<dyn ProgressSink>>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            job_id,
            total_items,
            total_batches,
            started: Instant::now(),
            items_processed: 0,
            last_percentage: 0.0,
            sequence: 0,
            sinks,
            publish_timeout,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn items_processed(&self) -> usize {
        self.items_processed
    }

    pub fn total_items(&self) -> usize {
        self.total_items
    }

    /// Time since the reporter was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Items per second so far.
    pub fn average_speed(&self) -> f64 {
        speed(self.items_processed, self.elapsed())
    }

    /// Counts a finished batch of `items` and returns the resulting progress.
    ///
    /// `estimated_time_remaining` comes from the caller's estimator.
    pub fn record_batch(
        &mut self,
        batch_index: usize,
        items: usize,
        estimated_time_remaining: Duration,
    ) -> ProgressEvent {
        self.items_processed = (self.items_processed + items).min(self.total_items);

        let percentage = if self.total_items == 0 {
            100.0
        } else {
            100.0 * self.items_processed as f64 / self.total_items as f64
        };
        self.last_percentage = percentage.clamp(0.0, 100.0).max(self.last_percentage);

        let elapsed = self.elapsed();
        ProgressEvent {
            batch_index,
            total_batches: self.total_batches,
            items_processed: self.items_processed,
            total_items: self.total_items,
            elapsed,
            average_speed: speed(self.items_processed, elapsed),
            estimated_time_remaining: if self.items_processed >= self.total_items {
                Duration::ZERO
            } else {
                estimated_time_remaining
            },
            progress_percentage: self.last_percentage,
        }
    }

    /// Publishes `event` to every sink.
    ///
    /// Each sink gets at most `publish_timeout`; a slow or failing sink is
    /// logged and skipped.
    pub async fn emit(&mut self, event: JobEvent) {
        let envelope = EventEnvelope {
            job_id: self.job_id,
            sequence: self.sequence,
            event,
        };
        self.sequence += 1;

        for sink in &self.sinks {
            match tokio::time::timeout(self.publish_timeout, sink.publish(&envelope)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        job_id = %self.job_id,
                        sink = sink.name(),
                        error = %e,
                        "Failed to publish job event"
                    );
                }
                Err(_) => {
                    warn!(
                        job_id = %self.job_id,
                        sink = sink.name(),
                        timeout_ms = self.publish_timeout.as_millis() as u64,
                        "Timed out publishing job event"
                    );
                }
            }
        }
    }

    /// Records a finished batch and publishes the progress event.
    pub async fn batch_completed(
        &mut self,
        batch_index: usize,
        items: usize,
        estimated_time_remaining: Duration,
    ) -> ProgressEvent {
        let progress = self.record_batch(batch_index, items, estimated_time_remaining);
        self.emit(JobEvent::Progress(progress.clone())).await;
        progress
    }

    /// Terminal event for a job that ran to the end.
    pub fn complete_event(&self, succeeded: usize, failed: usize) -> JobEvent {
        let total_time = self.elapsed();
        JobEvent::Complete {
            total_processed: self.items_processed,
            succeeded,
            failed,
            total_time,
            average_speed: speed(self.items_processed, total_time),
        }
    }

    /// Terminal event for a cancelled job.
    pub fn cancelled_event(&self) -> JobEvent {
        JobEvent::Cancelled {
            items_processed: self.items_processed,
            total_items: self.total_items,
            elapsed: self.elapsed(),
        }
    }
}

fn speed(items: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        items as f64 / secs
    } else {
        0.0
    }
}
