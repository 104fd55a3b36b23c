//! CLI command definitions for rag-orchestrator.
//!
//! Every command loads [`OrchestratorConfig`] from the environment and
//! assembles the components it needs for the selected backend.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde_json::Map;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::events::EventBus;
use crate::metrics::{export_metrics, init_metrics};
use crate::queue::{InMemoryTaskQueue, RedisTaskQueue, TaskQueue};
use crate::resilience::BreakerRegistry;
use crate::service::{ChunkInput, IngestionService};
use crate::storage::PgJobStore;
use crate::tracker::{
    InMemoryJobCache, JobStatus, JobTracker, RedisJobCache, INGESTION_JOB_TYPE,
};
use crate::workers::{LightRagProcessor, WorkerPool};

/// Job orchestration for RAG ingestion.
#[derive(Parser)]
#[command(name = "rag-orchestrator")]
#[command(about = "Queue, process and track RAG ingestion jobs")]
#[command(version)]
#[command(
    long_about = "rag-orchestrator runs a pool of workers that consume ingestion tasks from a Redis stream, send them to LightRAG through a circuit breaker and track job progress.\n\nConfiguration is read from the environment (REDIS_URL, DATABASE_URL, LIGHTRAG_URL, ORCHESTRATOR_*).\n\nExample usage:\n  rag-orchestrator submit --file chunks.jsonl --wait\n  rag-orchestrator worker --pool-size 8"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Where queue and job state live.
    #[arg(long, value_enum, default_value = "redis", global = true)]
    pub backend: Backend,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Redis streams and hashes, plus PostgreSQL when DATABASE_URL is set.
    Redis,
    /// Everything in-process. Nothing outlives the command.
    Memory,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the worker pool until Ctrl-C.
    Worker(WorkerArgs),

    /// Submit a JSONL file of chunks as one job.
    Submit(SubmitArgs),

    /// Show a job's progress.
    Status(StatusArgs),

    /// List recent jobs.
    Jobs(JobsArgs),

    /// Report queue, breaker and event bus health.
    Health,
}

#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of workers (overrides ORCHESTRATOR_POOL_SIZE).
    #[arg(short = 'n', long)]
    pub pool_size: Option<usize>,

    /// Seconds between health log lines.
    #[arg(long, default_value = "30")]
    pub health_interval: u64,

    /// Rewrite this file with Prometheus metrics on every health tick,
    /// for scraping through a textfile collector.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// JSONL file, one chunk per line: {"text": "...", "source_uri": "..."}.
    #[arg(short, long)]
    pub file: PathBuf,

    #[arg(long, default_value = INGESTION_JOB_TYPE)]
    pub job_type: String,

    /// Source type recorded on every task.
    #[arg(long, default_value = "text")]
    pub source_type: String,

    /// Wait for the job to finish, printing progress.
    #[arg(long)]
    pub wait: bool,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    pub job_id: String,
}

#[derive(Parser, Debug)]
pub struct JobsArgs {
    /// Only jobs with this status (queued, processing, completed, failed, cancelled).
    #[arg(long)]
    pub status: Option<String>,

    #[arg(long, default_value = "20")]
    pub limit: usize,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env().context("invalid configuration")?;
    let components = Components::build(&config, cli.backend).await?;

    match cli.command {
        Commands::Worker(args) => run_worker_command(components, args).await,
        Commands::Submit(args) => run_submit_command(components, args).await,
        Commands::Status(args) => run_status_command(components, args).await,
        Commands::Jobs(args) => run_jobs_command(components, args).await,
        Commands::Health => run_health_command(components).await,
    }
}

/// Shared components for one backend.
struct Components {
    config: OrchestratorConfig,
    backend: Backend,
    queue: Arc<dyn TaskQueue>,
    tracker: Arc<JobTracker>,
    events: EventBus,
    breakers: Arc<BreakerRegistry>,
}

impl Components {
    async fn build(config: &OrchestratorConfig, backend: Backend) -> anyhow::Result<Self> {
        let (queue, tracker): (Arc<dyn TaskQueue>, JobTracker) = match backend {
            Backend::Memory => (
                Arc::new(InMemoryTaskQueue::new(config.queue.clone())),
                JobTracker::new(Arc::new(InMemoryJobCache::new()), config.job_ttl),
            ),
            Backend::Redis => {
                let queue = RedisTaskQueue::connect(&config.redis_url, config.queue.clone())
                    .await
                    .context("failed to connect the task queue")?;
                let cache = RedisJobCache::connect(&config.redis_url)
                    .await
                    .context("failed to connect the job cache")?;
                let mut tracker = JobTracker::new(Arc::new(cache), config.job_ttl);

                if let Some(database_url) = &config.database_url {
                    let store = PgJobStore::connect(database_url)
                        .await
                        .context("failed to connect the job store")?;
                    store
                        .run_migrations()
                        .await
                        .context("job store migrations failed")?;
                    tracker = tracker.with_store(Arc::new(store));
                }
                (Arc::new(queue), tracker)
            }
        };

        info!(
            backend = ?backend,
            stream = %config.queue.stream_name,
            durable_store = tracker.has_store(),
            "Components ready"
        );

        Ok(Self {
            config: config.clone(),
            backend,
            queue,
            tracker: Arc::new(tracker),
            events: EventBus::new(config.events.clone()),
            breakers: Arc::new(BreakerRegistry::with_defaults(config.breaker.clone())),
        })
    }

    fn service(&self) -> IngestionService {
        IngestionService::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.tracker),
            self.events.clone(),
            Arc::clone(&self.breakers),
            self.config.pool.consumer_group.clone(),
        )
    }

    fn pool(&self, pool_size: Option<usize>) -> anyhow::Result<Arc<WorkerPool>> {
        let processor =
            LightRagProcessor::new(&self.config.lightrag_url, self.config.lightrag_timeout)?;
        let mut config = self.config.pool.clone();
        if let Some(size) = pool_size {
            config.pool_size = size;
        }
        Ok(Arc::new(WorkerPool::new(
            config,
            Arc::clone(&self.queue),
            Arc::clone(&self.tracker),
            Arc::new(self.events.clone()),
            Arc::clone(&self.breakers),
            Arc::new(processor),
        )))
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_worker_command(components: Components, args: WorkerArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry unavailable");
    }

    let pool = components.pool(args.pool_size)?;
    pool.start().await?;
    let service = components.service().with_pool(Arc::clone(&pool));

    let mut ticker = tokio::time::interval(Duration::from_secs(args.health_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, stopping workers");
                break;
            }
            _ = ticker.tick() => {
                let health = service.health().await;
                let workers = health.workers.as_ref();
                info!(
                    status = ?health.status,
                    queue_depth = ?health.queue.depth,
                    pending = ?health.queue.pending,
                    active_workers = workers.map(|w| w.active_workers).unwrap_or(0),
                    tasks_completed = workers.map(|w| w.tasks_completed).unwrap_or(0),
                    tasks_failed = workers.map(|w| w.tasks_failed).unwrap_or(0),
                    "Health"
                );
                if let Some(path) = &args.metrics_file {
                    if let Err(e) = write_metrics_file(path) {
                        warn!(path = %path.display(), error = %e, "Failed to write metrics file");
                    }
                }
            }
        }
    }

    let aborted = pool.shutdown().await?;
    if aborted > 0 {
        warn!(aborted = aborted, "Workers aborted at shutdown");
    }
    if let Some(path) = &args.metrics_file {
        write_metrics_file(path)?;
    }
    Ok(())
}

async fn run_submit_command(components: Components, args: SubmitArgs) -> anyhow::Result<()> {
    let chunks = read_chunks(&args.file)?;
    let service = components.service();

    // An in-process backend has nobody else to run the tasks.
    let local_pool = match components.backend {
        Backend::Memory => {
            let pool = components.pool(None)?;
            pool.start().await?;
            Some(pool)
        }
        Backend::Redis => None,
    };

    let receipt = service
        .submit(&args.job_type, chunks, &args.source_type, Map::new())
        .await?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);

    if args.wait || local_pool.is_some() {
        wait_for_job(&service, &receipt.job_id).await?;
    }

    if let Some(pool) = local_pool {
        pool.shutdown().await?;
    }
    Ok(())
}

async fn run_status_command(components: Components, args: StatusArgs) -> anyhow::Result<()> {
    let service = components.service();
    let progress = service
        .get_progress(&args.job_id)
        .await
        .with_context(|| format!("no status for job {}", args.job_id))?;
    println!("{}", serde_json::to_string_pretty(&progress)?);
    Ok(())
}

async fn run_jobs_command(components: Components, args: JobsArgs) -> anyhow::Result<()> {
    let status = args
        .status
        .as_deref()
        .map(JobStatus::from_str)
        .transpose()?;
    let jobs = components.service().list_jobs(status, args.limit).await?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

async fn run_health_command(components: Components) -> anyhow::Result<()> {
    let report = components.service().health().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Reads one chunk per non-blank line.
fn read_chunks(path: &Path) -> anyhow::Result<Vec<ChunkInput>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut chunks = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let chunk: ChunkInput = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid chunk", path.display(), index + 1))?;
        chunks.push(chunk);
    }

    if chunks.is_empty() {
        anyhow::bail!("{} contains no chunks", path.display());
    }
    Ok(chunks)
}

/// Replaces `path` with the current Prometheus export. The text is written
/// to a sibling file first so scrapers never read a partial export.
fn write_metrics_file(path: &Path) -> anyhow::Result<()> {
    let staging = path.with_extension("prom.tmp");
    std::fs::write(&staging, export_metrics())
        .with_context(|| format!("failed to write {}", staging.display()))?;
    std::fs::rename(&staging, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Polls the job until it reaches a terminal status or Ctrl-C.
async fn wait_for_job(service: &IngestionService, job_id: &str) -> anyhow::Result<()> {
    let mut last_processed = None;
    loop {
        let progress = service.get_progress(job_id).await?;
        if last_processed != Some(progress.tasks_processed) {
            last_processed = Some(progress.tasks_processed);
            println!(
                "{} {}/{} ({:.2}%) {}",
                job_id,
                progress.tasks_processed,
                progress.tasks_total,
                progress.percent_complete,
                progress.status
            );
        }
        if progress.status.is_terminal() {
            if let Some(error) = progress.error {
                warn!(job_id = job_id, error = %error, "Job finished with error");
            }
            return Ok(());
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
}
