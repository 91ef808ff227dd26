//! CLI command definitions for repose-forge.
//!
//! Every command resolves a [`ProcessorConfig`] first (defaults, then
//! `--config`, then the environment) and connects only to the backends it
//! needs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::generation::HttpOutputGenerator;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{
    BatchProcessor, InvocationQueue, LivenessSweeper, OutputCounts, ProcessRequest,
    ResumeContext, SubmitPayload, Submitter, WorkerPool, WorkerPoolConfig,
};
use crate::storage::{BatchStore, PgBatchStore};

/// Batch run processor for clay-pose generation.
#[derive(Parser)]
#[command(name = "repose-forge")]
#[command(about = "Expand batch runs into outputs and drive them through image generation")]
#[command(version)]
#[command(
    long_about = "repose-forge processes generation batches: it reclaims stalled work, expands runs into per-pose outputs, \
executes them with bounded concurrency and self-continues through a Redis queue before its time budget expires.\n\n\
Example usage:\n  repose-forge migrate\n  repose-forge submit --batch-id <ID> --pipeline-job-id <ID>\n  repose-forge worker --workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file layered under the environment.
    #[arg(short, long, global = true, env = "REPOSE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Apply the database schema.
    Migrate,

    /// Queue a batch for processing and print the response.
    Submit(SubmitArgs),

    /// Run one invocation in the foreground.
    ///
    /// A continuation, if the time budget runs out, goes to the Redis queue.
    Process(ProcessArgs),

    /// Run the supervisor pool until Ctrl-C.
    Worker(WorkerArgs),

    /// Run only the liveness sweeper for a batch.
    Sweep(BatchArgs),

    /// Print output counts for a batch.
    Status(BatchArgs),

    /// Print Prometheus metrics in text format.
    Metrics,
}

/// Arguments for `repose-forge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    #[arg(long)]
    pub batch_id: Uuid,

    #[arg(long)]
    pub pipeline_job_id: Uuid,

    /// Generation model; the configured default when omitted.
    #[arg(short, long)]
    pub model: Option<String>,
}

/// Arguments for `repose-forge process`.
#[derive(Parser, Debug)]
pub struct ProcessArgs {
    #[arg(long)]
    pub batch_id: Uuid,

    #[arg(long)]
    pub pipeline_job_id: Uuid,

    /// Generation model; the configured default when omitted.
    #[arg(short, long)]
    pub model: Option<String>,

    /// JSON file holding a resume context to continue from.
    #[arg(long)]
    pub resume: Option<PathBuf>,
}

/// Arguments for `repose-forge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of concurrent invocations.
    #[arg(short, long, default_value = "2")]
    pub workers: usize,
}

/// Arguments for commands scoped to one batch.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    #[arg(long)]
    pub batch_id: Uuid,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        tracing::debug!(error = %e, "Metrics already initialized");
    }

    let config = ProcessorConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Migrate => run_migrate_command(&config).await,
        Commands::Submit(args) => run_submit_command(&config, args).await,
        Commands::Process(args) => run_process_command(&config, args).await,
        Commands::Worker(args) => run_worker_command(&config, args).await,
        Commands::Sweep(args) => run_sweep_command(&config, args).await,
        Commands::Status(args) => run_status_command(&config, args).await,
        Commands::Metrics => {
            print!("{}", export_metrics());
            Ok(())
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_migrate_command(config: &ProcessorConfig) -> anyhow::Result<()> {
    let store = PgBatchStore::connect(&config.database_url).await?;
    let applied = store.run_migrations().await?;
    info!(applied = applied, "Migrations complete");
    println!("Applied {} migration step(s)", applied);
    Ok(())
}

async fn run_submit_command(config: &ProcessorConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let queue = InvocationQueue::connect(&config.redis_url, &config.queue_name).await?;
    let submitter = Submitter::new(Arc::new(queue), config.default_model.clone());

    let mut payload = SubmitPayload::new(args.batch_id, args.pipeline_job_id);
    if let Some(model) = args.model {
        payload = payload.with_model(model);
    }

    let response = submitter.submit(payload).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_process_command(config: &ProcessorConfig, args: ProcessArgs) -> anyhow::Result<()> {
    let resume_context = match args.resume.as_deref() {
        Some(path) => load_resume_context(path)?,
        None => ResumeContext::default(),
    };
    let model = args.model.unwrap_or_else(|| config.default_model.clone());
    let request = ProcessRequest::new(args.batch_id, args.pipeline_job_id, model)
        .with_resume_context(resume_context);

    let processor = connect_processor(config).await?;
    let outcome = processor.process(&request).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&InvocationSummary {
            batch_id: request.batch_id,
            outcome: outcome.as_str(),
            detail: format!("{:?}", outcome),
        })?
    );
    Ok(())
}

async fn run_worker_command(config: &ProcessorConfig, args: WorkerArgs) -> anyhow::Result<()> {
    let queue = Arc::new(InvocationQueue::connect(&config.redis_url, &config.queue_name).await?);
    let store = PgBatchStore::connect(&config.database_url).await?;
    let generator = HttpOutputGenerator::from_config(config)?;

    let processor = Arc::new(BatchProcessor::new(
        Arc::new(store),
        Arc::new(generator),
        queue.clone(),
        config.clone(),
    ));

    let pool_config = WorkerPoolConfig::from_processor_config(config, args.workers.max(1));
    let mut pool = WorkerPool::with_queue(pool_config, queue, processor);
    pool.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    pool.shutdown().await?;

    let stats = pool.stats();
    println!(
        "Processed {} invocation(s): {} completed, {} failed",
        stats.total_processed(),
        stats.invocations_completed,
        stats.invocations_failed
    );
    Ok(())
}

async fn run_sweep_command(config: &ProcessorConfig, args: BatchArgs) -> anyhow::Result<()> {
    let store = PgBatchStore::connect(&config.database_url).await?;
    let sweeper = LivenessSweeper::new(Arc::new(store), config.stale_threshold_chrono());
    let report = sweeper.sweep(args.batch_id).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_status_command(config: &ProcessorConfig, args: BatchArgs) -> anyhow::Result<()> {
    let store = PgBatchStore::connect(&config.database_url).await?;
    let batch = store
        .get_batch(args.batch_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Batch {} not found", args.batch_id))?;
    let counts = store.count_batch_outputs(args.batch_id).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&BatchStatusOutput {
            batch_id: batch.id,
            status: batch.status.to_string(),
            counts,
            total: counts.total(),
        })?
    );
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

#[derive(Debug, Serialize)]
struct InvocationSummary {
    batch_id: Uuid,
    outcome: &'static str,
    detail: String,
}

#[derive(Debug, Serialize)]
struct BatchStatusOutput {
    batch_id: Uuid,
    status: String,
    counts: OutputCounts,
    total: u64,
}

async fn connect_processor(config: &ProcessorConfig) -> anyhow::Result<BatchProcessor> {
    let store = PgBatchStore::connect(&config.database_url).await?;
    let queue = InvocationQueue::connect(&config.redis_url, &config.queue_name).await?;
    let generator = HttpOutputGenerator::from_config(config)?;
    Ok(BatchProcessor::new(
        Arc::new(store),
        Arc::new(generator),
        Arc::new(queue),
        config.clone(),
    ))
}

fn load_resume_context(path: &Path) -> anyhow::Result<ResumeContext> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read resume file {}: {}", path.display(), e))?;
    let context: ResumeContext = serde_json::from_str(&content)?;
    Ok(context)
}
