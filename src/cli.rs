//! Command-line interface for fairbatch.
//!
//! Provides commands for submitting jobs, inspecting groups and queues, and
//! running a worker node against a shared Redis instance.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::engine::{BulkSubmission, Engine};
use crate::fair_queue::EnqueueOptions;
use crate::job::{Job, PriorityLevel};
use crate::processor::{JobProcessor, ProcessorFailure, ProcessorOutput, ProcessorRegistry};

/// Fair, rate-limited bulk job distribution over Redis.
#[derive(Parser)]
#[command(name = "fairbatch")]
#[command(about = "Fair, rate-limited bulk job distribution over Redis")]
#[command(version)]
#[command(
    long_about = "fairbatch schedules bulk jobs across tenant groups with weighted fair queueing, admission control and adaptive backoff.\n\nExample usage:\n  fairbatch run --workers 4\n  fairbatch bulk --group tenant-a --processor demo --count 100"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a YAML config file; omitted sections keep their defaults.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Redis connection URL (overrides the config file).
    #[arg(long, env = "FAIRBATCH_REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit a single job to a group.
    Submit(SubmitArgs),

    /// Submit a batch of generated jobs as one group.
    Bulk(BulkArgs),

    /// Show one job record.
    Status(StatusArgs),

    /// Show progress and congestion state for a group.
    Progress(ProgressArgs),

    /// Show the depth of every queueing structure.
    Depths,

    /// List dead-lettered jobs.
    #[command(name = "dead-letters")]
    DeadLetters(DeadLettersArgs),

    /// Run a worker node until interrupted.
    Run(RunArgs),
}

/// Arguments for `fairbatch submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Group (tenant) the job belongs to.
    #[arg(short, long)]
    pub group: String,

    /// Processor type that will handle the job.
    #[arg(short, long)]
    pub processor: String,

    /// JSON payload for the job.
    #[arg(long, default_value = "{}")]
    pub payload: String,

    /// Additive base priority for the group's fairness score.
    #[arg(long, default_value = "0")]
    pub base_priority: i64,

    /// Priority tier (high, normal, low).
    #[arg(long, default_value = "normal")]
    pub priority: PriorityLevel,

    /// Explicit job id; generated when omitted.
    #[arg(long)]
    pub job_id: Option<String>,
}

/// Arguments for `fairbatch bulk`.
#[derive(Parser, Debug)]
pub struct BulkArgs {
    /// Group (tenant) the jobs belong to.
    #[arg(short, long)]
    pub group: String,

    /// Processor type that will handle the jobs.
    #[arg(short, long)]
    pub processor: String,

    /// Number of jobs to generate.
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Additive base priority for the group's fairness score.
    #[arg(long, default_value = "0")]
    pub base_priority: i64,

    /// Priority tier (high, normal, low).
    #[arg(long, default_value = "normal")]
    pub priority: PriorityLevel,
}

/// Arguments for `fairbatch status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job id to look up.
    pub job_id: String,
}

/// Arguments for `fairbatch progress`.
#[derive(Parser, Debug)]
pub struct ProgressArgs {
    /// Group id to report on.
    pub group_id: String,
}

/// Arguments for `fairbatch dead-letters`.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Maximum entries to show, oldest first.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,
}

/// Arguments for `fairbatch run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of workers (overrides the config file).
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Simulated processing time per demo job, in milliseconds.
    #[arg(long, default_value = "100")]
    pub demo_duration_ms: u64,

    /// Failure probability for the demo processor, 0.0 to 1.0.
    #[arg(long, default_value = "0.0")]
    pub demo_failure_rate: f64,
}

/// Parse CLI arguments without executing the command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Submit(args) => run_submit_command(config, args).await,
        Commands::Bulk(args) => run_bulk_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Progress(args) => run_progress_command(config, args).await,
        Commands::Depths => run_depths_command(config).await,
        Commands::DeadLetters(args) => run_dead_letters_command(config, args).await,
        Commands::Run(args) => run_worker_command(config, args).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            EngineConfig::from_yaml(&content)?
        }
        None => EngineConfig::default(),
    };

    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url);
    }

    Ok(config)
}

async fn run_submit_command(config: EngineConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&args.payload)?;
    let job_id = args
        .job_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let engine = Engine::connect(config, ProcessorRegistry::new()).await?;

    let options = EnqueueOptions::new(&args.group, &job_id, &args.processor, payload)
        .with_base_priority(args.base_priority)
        .with_priority_level(args.priority);

    let total = engine.submit_job(&options).await?;

    println!("Submitted job {job_id} to group {} ({total} total)", args.group);
    Ok(())
}

async fn run_bulk_command(config: EngineConfig, args: BulkArgs) -> anyhow::Result<()> {
    let engine = Engine::connect(config, ProcessorRegistry::new()).await?;

    let payloads: Vec<serde_json::Value> = (0..args.count)
        .map(|i| serde_json::json!({ "index": i }))
        .collect();

    let submission = BulkSubmission::new(&args.group, &args.processor, payloads)
        .with_base_priority(args.base_priority)
        .with_priority_level(args.priority);

    let job_ids = engine.submit_bulk(&submission).await?;

    println!("Submitted {} jobs to group {}", job_ids.len(), args.group);
    Ok(())
}

async fn run_status_command(config: EngineConfig, args: StatusArgs) -> anyhow::Result<()> {
    let engine = Engine::connect(config, ProcessorRegistry::new()).await?;
    let job = engine.get_job(&args.job_id).await?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn run_progress_command(config: EngineConfig, args: ProgressArgs) -> anyhow::Result<()> {
    let engine = Engine::connect(config, ProcessorRegistry::new()).await?;
    let progress = engine.get_group_progress(&args.group_id).await?;

    println!("{}", serde_json::to_string_pretty(&progress)?);
    Ok(())
}

async fn run_depths_command(config: EngineConfig) -> anyhow::Result<()> {
    let engine = Engine::connect(config, ProcessorRegistry::new()).await?;
    let depths = engine.queue_depths().await?;

    println!("Fair queue groups:");
    println!("  high:   {}", depths.fair_queue.high_priority_groups);
    println!("  normal: {}", depths.fair_queue.normal_priority_groups);
    println!("  low:    {}", depths.fair_queue.low_priority_groups);
    println!("Ready queue:     {}", depths.ready);
    println!("Non-ready queue: {}", depths.non_ready);
    println!("Dead letters:    {}", depths.dead_letter);
    Ok(())
}

async fn run_dead_letters_command(config: EngineConfig, args: DeadLettersArgs) -> anyhow::Result<()> {
    let engine = Engine::connect(config, ProcessorRegistry::new()).await?;
    let entries = engine.peek_dead_letters(args.limit).await?;

    if entries.is_empty() {
        println!("No dead-lettered jobs");
        return Ok(());
    }

    for entry in entries {
        println!(
            "{}  group={}  retries={}  {}",
            entry.job.id, entry.job.group_id, entry.retry_count, entry.error
        );
    }
    Ok(())
}

async fn run_worker_command(mut config: EngineConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config = config.with_worker_count(workers);
    }

    let mut registry = ProcessorRegistry::new();
    registry.register(Arc::new(DemoProcessor {
        duration: Duration::from_millis(args.demo_duration_ms),
        failure_rate: args.demo_failure_rate.clamp(0.0, 1.0),
    }));

    let mut engine = Engine::connect(config, registry).await?;
    engine.start().await?;
    info!("Worker node running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("Interrupt received, shutting down");

    engine.shutdown().await?;

    let status = engine.pool_status();
    info!(
        fetched = status.fetcher_stats.total_fetched,
        dispatched = status.dispatcher_stats.total_moved,
        "Worker node stopped"
    );
    Ok(())
}

/// Built-in processor for the `run` command: sleeps for a configured
/// duration and fails with a configurable probability.
struct DemoProcessor {
    duration: Duration,
    failure_rate: f64,
}

#[async_trait::async_trait]
impl JobProcessor for DemoProcessor {
    fn kind(&self) -> &str {
        "demo"
    }

    async fn process(&self, job: &Job) -> Result<ProcessorOutput, ProcessorFailure> {
        tokio::time::sleep(self.duration).await;

        let roll: f64 = rand::thread_rng().gen();
        if roll < self.failure_rate {
            return Err(ProcessorFailure::retryable(format!(
                "Simulated failure for job {}",
                job.id
            )));
        }

        Ok(ProcessorOutput::default())
    }
}
