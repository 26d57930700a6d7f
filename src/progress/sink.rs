//! Destinations for job events.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use super::reporter::{EventEnvelope, JobEvent};
use crate::error::SinkError;

/// A push channel toward an external transport.
///
/// Delivery is best-effort: the reporter bounds every `publish` call with a
/// timeout, so an implementation may block but must not rely on it.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, event: &EventEnvelope) -> Result<(), SinkError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "sink"
    }
}

/// Forwards events into a bounded channel.
pub struct ChannelSink {
    tx: mpsc::Sender<EventEnvelope>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that observes it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressSink for ChannelSink {
    async fn publish(&self, event: &EventEnvelope) -> Result<(), SinkError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl ProgressSink for TracingSink {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        let job_id = envelope.job_id;
        match &envelope.event {
            JobEvent::Started {
                total_items,
                total_batches,
                estimated_duration,
            } => info!(
                job_id = %job_id,
                total_items = total_items,
                total_batches = total_batches,
                estimated_secs = estimated_duration.as_secs_f64(),
                "Job started"
            ),
            JobEvent::Progress(p) => info!(
                job_id = %job_id,
                batch_index = p.batch_index,
                items_processed = p.items_processed,
                total_items = p.total_items,
                progress_pct = format!("{:.1}%", p.progress_percentage),
                items_per_sec = format!("{:.2}", p.average_speed),
                eta_secs = p.estimated_time_remaining.as_secs(),
                "Job progress"
            ),
            JobEvent::CircuitStateChanged { from, to, message, .. } => warn!(
                job_id = %job_id,
                from = %from,
                to = %to,
                "{}",
                message
            ),
            JobEvent::Error {
                message,
                recoverable,
                batch_index,
            } => warn!(
                job_id = %job_id,
                recoverable = recoverable,
                batch_index = ?batch_index,
                "Job error: {}",
                message
            ),
            JobEvent::Complete {
                total_processed,
                succeeded,
                failed,
                total_time,
                average_speed,
            } => info!(
                job_id = %job_id,
                total_processed = total_processed,
                succeeded = succeeded,
                failed = failed,
                total_secs = total_time.as_secs_f64(),
                items_per_sec = format!("{:.2}", average_speed),
                "Job complete"
            ),
            JobEvent::Cancelled {
                items_processed,
                total_items,
                ..
            } => info!(
                job_id = %job_id,
                items_processed = items_processed,
                total_items = total_items,
                "Job cancelled"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Writes one JSON object per line to an async writer.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonLinesSink<tokio::io::Stderr> {
    /// Sink writing to standard error.
    pub fn stderr() -> Self {
        Self::new(tokio::io::stderr())
    }
}

#[async_trait]
impl<W> ProgressSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn publish(&self, event: &EventEnvelope) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "json_lines"
    }
}
