use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use exprunner::baker::CredentialBaker;
use exprunner::client::Client;
use exprunner::config::{SandboxConfig, WorkerConfig};
use exprunner::db::MemoryDb;
use exprunner::experiment::{ArtifactBinding, CaptureMode, Experiment, OUTPUT_ARTIFACT};
use exprunner::queue::{fresh_queue_name, MemoryQueue};
use exprunner::shutdown::install_shutdown_handler;
use exprunner::store::MemoryStore;
use exprunner::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "exprunner")]
#[command(version)]
#[command(about = "A distributed experiment execution framework")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a worker that claims and executes jobs from a queue
    Worker(WorkerArgs),

    /// Submit an experiment and drive it to completion with a local
    /// single-run worker
    Run(RunArgs),

    /// Bake credentials into a derived execution image
    Bake(BakeArgs),
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Queue to claim jobs from
    #[arg(long)]
    queue: String,

    /// Exit after processing one job
    #[arg(long)]
    single_run: bool,

    /// Docker image to execute jobs in (omit to run jobs directly)
    #[arg(long)]
    image: Option<String>,

    /// Root directory for per-experiment working directories
    #[arg(long)]
    work_root: Option<PathBuf>,

    /// Source snapshot copied into working directories before execution
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Wall-clock limit on job execution, in seconds
    #[arg(long, default_value = "300")]
    timeout_secs: u64,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Script to execute
    script: String,

    /// Arguments passed to the script
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Experiment name (defaults to a fresh random identity)
    #[arg(long)]
    name: Option<String>,

    /// Queue name (defaults to a fresh random identity, isolating this run)
    #[arg(long)]
    queue: Option<String>,

    /// Docker image to execute the job in (omit to run directly)
    #[arg(long)]
    image: Option<String>,

    /// Continuously captured artifact, as <localPath>:<artifactName>
    #[arg(long = "capture")]
    capture: Vec<String>,

    /// One-shot captured artifact, as <localPath>:<artifactName>
    #[arg(long = "capture-once")]
    capture_once: Vec<String>,

    /// Re-fetch the source snapshot instead of reusing a cached copy
    #[arg(long = "force-git")]
    force_git: bool,

    /// Source snapshot copied into the working directory before execution
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Wall-clock limit on job execution, in seconds
    #[arg(long, default_value = "300")]
    timeout_secs: u64,
}

#[derive(Parser, Debug)]
struct BakeArgs {
    /// Tag for the derived image
    #[arg(long)]
    tag: String,

    /// Base image to derive from
    #[arg(long)]
    base_image: String,

    /// Credential bundle file to embed
    #[arg(long)]
    credentials: PathBuf,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn sandbox_for(image: Option<String>) -> SandboxConfig {
    match image {
        Some(image) => SandboxConfig::with_image(image),
        None => SandboxConfig::default(),
    }
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = WorkerConfig::new(args.queue).with_sandbox(sandbox_for(args.image));
    config.single_run = args.single_run;
    config.execution_timeout = Duration::from_secs(args.timeout_secs);
    if let Some(work_root) = args.work_root {
        config.work_root = work_root;
    }
    config.source_dir = args.source_dir;

    let worker = Worker::new(
        config,
        Arc::new(MemoryQueue::new()),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryDb::new()),
    );

    let shutdown = install_shutdown_handler();
    let processed = worker.run(shutdown).await?;
    tracing::info!(processed, "Worker exited cleanly");
    Ok(())
}

async fn run_experiment(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(MemoryDb::new());
    let client = Client::new(queue.clone(), store.clone(), db.clone());

    let queue_name = args
        .queue
        .unwrap_or_else(|| fresh_queue_name("exprunner"));
    let name = args
        .name
        .unwrap_or_else(|| fresh_queue_name("experiment"));

    let mut experiment =
        Experiment::new(&name, &args.script, args.args).with_force_fetch(args.force_git);
    for spec in &args.capture {
        experiment = experiment.with_binding(ArtifactBinding::parse(spec, CaptureMode::Continuous)?);
    }
    for spec in &args.capture_once {
        experiment = experiment.with_binding(ArtifactBinding::parse(spec, CaptureMode::Once)?);
    }

    client.submit(&queue_name, experiment).await?;

    let mut config = WorkerConfig::new(&queue_name)
        .single_run()
        .with_sandbox(sandbox_for(args.image));
    config.execution_timeout = Duration::from_secs(args.timeout_secs);
    config.source_dir = args.source_dir;

    let worker = Worker::new(config, queue, store.clone(), db);
    let shutdown = install_shutdown_handler();
    worker.run(shutdown).await?;

    let experiment = client.get_experiment(&name).await?;
    println!("Experiment: {}", experiment.name);
    println!("Status:     {}", experiment.status);
    if let Some(output) = experiment.artifacts.get(OUTPUT_ARTIFACT) {
        if let Some(bytes) = store.peek(&output.experiment, &output.name).await {
            let stdout = String::from_utf8_lossy(&bytes);
            if !stdout.is_empty() {
                println!("Output:");
                for line in stdout.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn run_bake(args: BakeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let baker = CredentialBaker::new();
    let image = baker
        .bake(&args.base_image, &args.credentials, &args.tag)
        .await?;
    println!("Baked image: {}", image);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Run(run_args) => run_experiment(run_args).await?,
        Commands::Bake(bake_args) => run_bake(bake_args).await?,
    }

    Ok(())
}
