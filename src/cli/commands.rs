//! CLI command definitions for feedback-forge.
//!
//! Records are read as JSON lines (`{"id": "...", "text": "..."}`), results
//! are written as JSON lines, and job events stream to stderr.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{info, warn};

use crate::pipeline::{BatchJobController, CancelHandle, EngineConfig, Job, JobStats, JobStatus};
use crate::progress::{JsonLinesSink, SqliteHistoryStore, TimeEstimator, TracingSink};
use crate::scoring::{HttpRemoteScorer, LexiconScorer};
use crate::types::{OperationType, Record};

/// Batch scoring engine for customer feedback.
#[derive(Parser)]
#[command(name = "feedback-forge")]
#[command(about = "Score customer feedback in memory-aware, fault-tolerant batches")]
#[command(version)]
#[command(
    long_about = "feedback-forge scores free-text feedback records for sentiment, category and keywords.\n\nA remote scoring service is used when configured and healthy; a local lexicon scorer takes over when it is not.\n\nExample usage:\n  feedback-forge score --input feedback.jsonl --output scores.jsonl --remote-url https://scoring.internal"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Score a JSON-lines file of feedback records.
    Score(ScoreArgs),

    /// Predict how long scoring a file would take, without scoring it.
    #[command(alias = "est")]
    Estimate(EstimateArgs),
}

/// How job events are reported while scoring.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EventFormat {
    /// One JSON object per line on stderr.
    #[default]
    Json,
    /// Structured log lines.
    Log,
    /// No event output.
    Off,
}

/// Arguments for `feedback-forge score`.
#[derive(Parser, Debug)]
pub struct ScoreArgs {
    /// Input file with one JSON record per line.
    #[arg(short, long)]
    pub input: String,

    /// Output file for results (JSON lines). Defaults to stdout.
    #[arg(short, long)]
    pub output: Option<String>,

    /// Operation to perform (sentiment, categorization, summarization).
    #[arg(long, default_value = "sentiment")]
    pub operation: OperationType,

    /// Remote scoring service base URL (falls back to FEEDBACK_REMOTE_URL).
    #[arg(long)]
    pub remote_url: Option<String>,

    /// Bearer token for the remote scoring service.
    #[arg(long, env = "FEEDBACK_REMOTE_API_KEY", hide_env_values = true)]
    pub remote_api_key: Option<String>,

    /// Maximum concurrent batches (overrides FEEDBACK_MAX_WORKERS).
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// SQLite database holding throughput history across runs.
    #[arg(long, env = "FEEDBACK_HISTORY_DB")]
    pub history_db: Option<String>,

    /// Job event output format.
    #[arg(long, value_enum, default_value_t = EventFormat::Json)]
    pub events: EventFormat,

    /// Print Prometheus metrics to stderr when the job ends.
    #[arg(long)]
    pub metrics: bool,

    /// Print a JSON summary to stderr instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `feedback-forge estimate`.
#[derive(Parser, Debug)]
pub struct EstimateArgs {
    /// Input file with one JSON record per line.
    #[arg(short, long)]
    pub input: String,

    /// Operation to estimate.
    #[arg(long, default_value = "sentiment")]
    pub operation: OperationType,

    /// SQLite database holding throughput history across runs.
    #[arg(long, env = "FEEDBACK_HISTORY_DB")]
    pub history_db: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments without running the command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Score(args) => run_score_command(args).await,
        Commands::Estimate(args) => run_estimate_command(args).await,
    }
}

// ============================================================================
// Score Command
// ============================================================================

#[derive(Debug, Serialize)]
struct ScoreSummary {
    job_id: String,
    status: JobStatus,
    #[serde(flatten)]
    stats: JobStats,
    success_rate: f64,
    circuit_state: String,
    error: Option<String>,
}

async fn run_score_command(args: ScoreArgs) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env().context("Invalid FEEDBACK_* configuration")?;
    if let Some(workers) = args.workers {
        config = config.with_max_workers(workers);
        config.validate()?;
    }

    if args.metrics {
        crate::metrics::init_metrics().context("Failed to register metrics")?;
    }

    let records = read_records(Path::new(&args.input)).await?;
    info!(input = %args.input, records = records.len(), "Loaded records");

    let estimator = build_estimator(&config, args.history_db.as_deref()).await?;
    let mut controller =
        BatchJobController::new(config.clone(), Arc::new(LexiconScorer::new()))?
            .with_estimator(estimator);

    let remote = match args.remote_url {
        Some(url) => Some(HttpRemoteScorer::new(
            url,
            args.remote_api_key,
            config.remote_timeout,
        )?),
        None => HttpRemoteScorer::from_env(config.remote_timeout)?,
    };
    match remote {
        Some(remote) => {
            info!(api_base = remote.api_base(), "Using remote scorer");
            controller = controller.with_remote(Arc::new(remote));
        }
        None => info!("No remote scorer configured, scoring locally"),
    }

    controller = match args.events {
        EventFormat::Json => controller.with_sink(Arc::new(JsonLinesSink::stderr())),
        EventFormat::Log => controller.with_sink(Arc::new(TracingSink)),
        EventFormat::Off => controller,
    };

    let cancel = CancelHandle::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight batches");
            on_signal.cancel();
        }
    });

    let job = Job::new(args.operation, records);
    let outcome = controller.run(job, &cancel).await?;

    match args.output.as_deref() {
        Some(path) => {
            let file = fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create output file: {}", path))?;
            write_results(BufWriter::new(file), &outcome.results).await?;
            info!(output = %path, results = outcome.results.len(), "Results written");
        }
        None => write_results(BufWriter::new(tokio::io::stdout()), &outcome.results).await?,
    }

    let summary = ScoreSummary {
        job_id: outcome.job_id.to_string(),
        status: outcome.status,
        success_rate: outcome.stats.success_rate(),
        stats: outcome.stats.clone(),
        circuit_state: controller.breaker().state().to_string(),
        error: outcome.error.clone(),
    };

    if args.json {
        eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        eprintln!();
        eprintln!("=== Scoring Summary ===");
        eprintln!("Job:            {}", summary.job_id);
        eprintln!("Status:         {}", summary.status);
        eprintln!("Records:        {}", summary.stats.total_records);
        eprintln!("Scored:         {}", summary.stats.succeeded);
        eprintln!("Failed:         {}", summary.stats.failed);
        eprintln!(
            "Sources:        {} remote, {} local, {} cached",
            summary.stats.remote_count, summary.stats.local_count, summary.stats.cache_hits
        );
        eprintln!("Elapsed:        {:.1}s", summary.stats.total_time.as_secs_f64());
        eprintln!("Speed:          {:.1} records/s", summary.stats.average_speed);
        eprintln!("Circuit:        {}", summary.circuit_state);
        if let Some(err) = &summary.error {
            eprintln!("Error:          {}", err);
        }
    }

    if args.metrics {
        eprintln!("{}", crate::metrics::export_metrics());
    }

    if outcome.status == JobStatus::Failed {
        anyhow::bail!(
            "Job {} failed: {}",
            outcome.job_id,
            outcome.error.unwrap_or_default()
        );
    }
    Ok(())
}

// ============================================================================
// Estimate Command
// ============================================================================

#[derive(Debug, Serialize)]
struct EstimateOutput {
    operation: OperationType,
    records: usize,
    history_samples: usize,
    estimated_secs: f64,
}

async fn run_estimate_command(args: EstimateArgs) -> anyhow::Result<()> {
    let config = EngineConfig::from_env().context("Invalid FEEDBACK_* configuration")?;
    let records = read_records(Path::new(&args.input)).await?;

    let estimator = build_estimator(&config, args.history_db.as_deref()).await?;
    estimator.hydrate(args.operation).await?;

    let controller = BatchJobController::new(config, Arc::new(LexiconScorer::new()))?
        .with_estimator(Arc::clone(&estimator));
    let estimate = controller.estimate(&records, args.operation);

    let output = EstimateOutput {
        operation: args.operation,
        records: records.len(),
        history_samples: estimator.sample_count(args.operation),
        estimated_secs: estimate.as_secs_f64(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "{} records ({}): ~{} ({} history samples)",
            output.records,
            output.operation,
            format_duration(estimate),
            output.history_samples
        );
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

async fn build_estimator(
    config: &EngineConfig,
    history_db: Option<&str>,
) -> anyhow::Result<Arc<TimeEstimator>> {
    let estimator = TimeEstimator::new(config.history_window);
    let estimator = match history_db {
        Some(path) => {
            let store = SqliteHistoryStore::open(path)
                .await
                .with_context(|| format!("Failed to open history database: {}", path))?;
            estimator.with_store(Arc::new(store))
        }
        None => estimator,
    };
    Ok(Arc::new(estimator))
}

async fn read_records(path: &Path) -> anyhow::Result<Vec<Record>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    parse_records(&content)
}

/// Parses JSON lines into records, skipping blank lines.
fn parse_records(content: &str) -> anyhow::Result<Vec<Record>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<Record>(line)
                .with_context(|| format!("Invalid record on line {}", idx + 1))
        })
        .collect()
}

async fn write_results<W, T>(mut writer: W, results: &[T]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    for result in results {
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
    }
    writer.flush().await?;
    Ok(())
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
