//! Command-line surface.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};

use queuectl_core::{config, JobSpec, JobState, JobStore, QueueError};
use queuectl_store_sqlite::SqliteStore;

use crate::{supervisor, worker};

/// CLI background job queue: enqueue shell commands, run them on a pool of
/// worker processes, retry failures with exponential backoff, and park
/// exhausted jobs in a dead letter queue.
#[derive(Debug, Parser)]
#[command(name = "queuectl", version)]
pub struct Cli {
    /// Path to the sqlite database file.
    #[arg(long, global = true, env = "QUEUECTL_DB", default_value = "queuectl.db")]
    pub db: PathBuf,

    #[command(subcommand)]
    pub command: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Add a new job to the queue.
    Enqueue(EnqueueArgs),
    /// Worker operations.
    Worker {
        #[command(subcommand)]
        command: WorkerCmd,
    },
    /// Summary of job states and active workers.
    Status,
    /// List jobs, oldest first.
    List {
        /// Only show jobs in this state.
        #[arg(long, value_enum)]
        state: Option<StateFilter>,
    },
    /// Dead letter queue operations.
    Dlq {
        #[command(subcommand)]
        command: DlqCmd,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        command: ConfigCmd,
    },
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct EnqueueArgs {
    /// Inline JSON job spec.
    #[arg(long)]
    pub json: Option<String>,
    /// Path to a JSON file with the job spec.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum WorkerCmd {
    /// Start one or more worker processes.
    Start {
        /// Number of workers to start.
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Signal running workers to stop after their current job.
    Stop,
    /// Run a worker loop in this process.
    #[command(hide = true)]
    Run,
}

#[derive(Debug, Subcommand)]
pub enum DlqCmd {
    /// List DLQ entries, newest failure first.
    List,
    /// Promote a DLQ entry back to a fresh pending job.
    Retry { job_id: String },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    /// Print one value, or all key=value pairs.
    Get { key: Option<String> },
    /// Upsert a config value.
    Set { key: String, value: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StateFilter {
    Pending,
    Processing,
    Completed,
}

impl From<StateFilter> for JobState {
    fn from(filter: StateFilter) -> Self {
        match filter {
            StateFilter::Pending => JobState::Pending,
            StateFilter::Processing => JobState::Processing,
            StateFilter::Completed => JobState::Completed,
        }
    }
}

/// Exit code for rejected enqueue payloads.
const EXIT_INVALID_SPEC: u8 = 2;

pub async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Cmd::Enqueue(args) => cmd_enqueue(&cli.db, args).await,
        Cmd::Worker { command } => match command {
            WorkerCmd::Start { count } => cmd_worker_start(&cli.db, count).await,
            WorkerCmd::Stop => cmd_worker_stop(),
            WorkerCmd::Run => {
                worker::run_worker_process(&cli.db).await?;
                Ok(ExitCode::SUCCESS)
            }
        },
        Cmd::Status => cmd_status(&cli.db).await,
        Cmd::List { state } => cmd_list(&cli.db, state).await,
        Cmd::Dlq { command } => match command {
            DlqCmd::List => cmd_dlq_list(&cli.db).await,
            DlqCmd::Retry { job_id } => cmd_dlq_retry(&cli.db, &job_id).await,
        },
        Cmd::Config { command } => match command {
            ConfigCmd::Get { key } => cmd_config_get(&cli.db, key.as_deref()).await,
            ConfigCmd::Set { key, value } => cmd_config_set(&cli.db, &key, &value).await,
        },
    }
}

async fn cmd_enqueue(db: &Path, args: EnqueueArgs) -> Result<ExitCode> {
    let payload = match (args.json, args.file) {
        (Some(inline), None) => inline,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        _ => bail!("exactly one of --json or --file is required"),
    };

    let spec = match JobSpec::parse(&payload) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("{e}");
            return Ok(ExitCode::from(EXIT_INVALID_SPEC));
        }
    };

    let store = SqliteStore::connect(db).await?;
    let default_max_retries = config::int_or(
        store.config_get(config::MAX_RETRIES).await?.as_deref(),
        config::DEFAULT_MAX_RETRIES,
    );

    let job = match spec.into_job(default_max_retries, Utc::now()) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("{e}");
            return Ok(ExitCode::from(EXIT_INVALID_SPEC));
        }
    };

    match store.insert_job(&job).await {
        Ok(()) => {
            println!("Enqueued job {}", job.id);
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ QueueError::DuplicateJob(_)) => {
            eprintln!("{e}");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_worker_start(db: &Path, count: u32) -> Result<ExitCode> {
    // Create the schema once up front; children still retry on their own.
    SqliteStore::connect(db).await?;

    let pids = supervisor::start_workers(db, count).await?;
    println!(
        "Started {} worker(s): {}",
        pids.len(),
        pids.iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_worker_stop() -> Result<ExitCode> {
    let signaled = supervisor::stop_workers();
    if signaled == 0 {
        println!("No worker PIDs found.");
    } else {
        println!(
            "Signaled {signaled} worker(s) to stop. They will finish the current job then exit."
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_status(db: &Path) -> Result<ExitCode> {
    let store = SqliteStore::connect(db).await?;
    let counts = store.counts().await?;
    let workers = supervisor::live_pids();

    println!("Jobs:");
    println!("  {:>11}: {}", "pending", counts.pending);
    println!("  {:>11}: {}", "processing", counts.processing);
    println!("  {:>11}: {}", "completed", counts.completed);
    println!("  {:>11}: {}", "in_dlq", counts.in_dlq);

    let listing = if workers.is_empty() {
        "-".to_string()
    } else {
        workers
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("Workers active: {} -> {}", workers.len(), listing);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_list(db: &Path, state: Option<StateFilter>) -> Result<ExitCode> {
    let store = SqliteStore::connect(db).await?;
    let jobs = store.list_jobs(state.map(JobState::from)).await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(ExitCode::SUCCESS);
    }
    for job in jobs {
        println!(
            "{}: state={}, attempts={}/{}, run_at={}, prio={}",
            job.id, job.state, job.attempts, job.max_retries, job.run_at, job.priority
        );
        println!("    cmd={}", job.command);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_dlq_list(db: &Path) -> Result<ExitCode> {
    let store = SqliteStore::connect(db).await?;
    let entries = store.list_dlq().await?;
    if entries.is_empty() {
        println!("DLQ is empty.");
        return Ok(ExitCode::SUCCESS);
    }
    for entry in entries {
        println!(
            "{}: attempts={}/{}, failed_at={}",
            entry.id, entry.attempts, entry.max_retries, entry.failed_at
        );
        println!("    last_error={}", entry.last_error.as_deref().unwrap_or(""));
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_dlq_retry(db: &Path, job_id: &str) -> Result<ExitCode> {
    let store = SqliteStore::connect(db).await?;
    match store.dlq_promote(job_id, Utc::now()).await {
        Ok(()) => {
            println!("Re-enqueued {job_id} from DLQ");
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ QueueError::NotInDlq(_)) => {
            eprintln!("{e}");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_config_get(db: &Path, key: Option<&str>) -> Result<ExitCode> {
    let store = SqliteStore::connect(db).await?;
    match key {
        Some(key) => println!("{}", store.config_get(key).await?.unwrap_or_default()),
        None => {
            for (key, value) in store.config_all().await? {
                println!("{key}={value}");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_config_set(db: &Path, key: &str, value: &str) -> Result<ExitCode> {
    let store = SqliteStore::connect(db).await?;
    store.config_set(key, value).await?;
    println!("set {key}={value}");
    Ok(ExitCode::SUCCESS)
}
