//! Worker loop: claim, execute, settle.
//!
//! Workers are independent OS processes. The durable store is their only
//! coordination point; a worker that dies mid-job leaves the row in
//! `processing` for manual inspection rather than silently resurrecting it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use queuectl_core::{clock, config, decide_failure, FailureOutcome, Job, JobStore};
use queuectl_store_sqlite::SqliteStore;

use crate::exec::{self, ExecOutcome};
use crate::paths;

/// Sleep between empty polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Process-wide stop flag cooperating with SIGINT/SIGTERM.
///
/// Raising the flag never interrupts the job in flight; the worker checks
/// it between loop iterations and refuses only the next claim.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise the flag when SIGINT or SIGTERM is delivered.
    pub fn listen_for_signals(&self) -> std::io::Result<()> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let flag = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
            info!("shutdown requested, finishing current job");
            flag.raise();
        });
        Ok(())
    }
}

/// One worker's claim/execute/settle loop over a shared store.
pub struct Worker<S> {
    store: S,
    worker_id: String,
    shutdown: ShutdownFlag,
    poll_interval: Duration,
    log_dir: PathBuf,
}

impl<S: JobStore> Worker<S> {
    pub fn new(store: S, worker_id: impl Into<String>, shutdown: ShutdownFlag) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            shutdown,
            poll_interval: POLL_INTERVAL,
            log_dir: paths::logs_dir(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_log_dir(mut self, dir: PathBuf) -> Self {
        self.log_dir = dir;
        self
    }

    /// Run until the shutdown flag is raised.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = %self.worker_id, "worker started");
        while !self.shutdown.is_raised() {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    // Transient store contention; the next poll retries.
                    warn!(worker_id = %self.worker_id, error = %e, "poll failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    /// One claim/execute/settle cycle. Returns whether a job was executed.
    pub async fn poll_once(&self) -> Result<bool> {
        let Some(job) = self.store.claim_next(&self.worker_id, Utc::now()).await? else {
            return Ok(false);
        };
        self.execute(job).await?;
        Ok(true)
    }

    async fn execute(&self, job: Job) -> Result<()> {
        let timeout = self.effective_timeout(&job).await?;
        info!(job_id = %job.id, attempts = job.attempts, ?timeout, "executing");

        let outcome = exec::run_command(&job.command, timeout).await?;
        if let Err(e) = self.append_job_log(&job, &outcome).await {
            warn!(job_id = %job.id, error = %e, "failed to append job log");
        }

        if outcome.success() {
            self.store.mark_completed(&job.id, Utc::now()).await?;
            info!(job_id = %job.id, "completed");
            return Ok(());
        }

        let base = config::int_or(
            self.store.config_get(config::BACKOFF_BASE).await?.as_deref(),
            config::DEFAULT_BACKOFF_BASE,
        );
        match decide_failure(
            job.attempts,
            job.max_retries,
            base,
            Utc::now(),
            &outcome.error_message(),
        ) {
            FailureOutcome::Retry {
                attempts,
                run_at,
                last_error,
            } => {
                self.store
                    .mark_retry(&job.id, attempts, run_at, &last_error, Utc::now())
                    .await?;
                warn!(job_id = %job.id, attempts, "attempt failed, retry scheduled");
            }
            FailureOutcome::DeadLetter {
                attempts,
                failed_at,
                last_error,
            } => {
                self.store
                    .move_to_dlq(&job.id, attempts, failed_at, &last_error)
                    .await?;
                warn!(job_id = %job.id, attempts, "retries exhausted, moved to DLQ");
            }
        }
        Ok(())
    }

    /// Per-job timeout when set, configured default otherwise.
    async fn effective_timeout(&self, job: &Job) -> Result<Option<i64>> {
        if let Some(t) = job.timeout {
            return Ok(Some(t));
        }
        let configured = self.store.config_get(config::JOB_TIMEOUT).await?;
        Ok(Some(config::int_or(
            configured.as_deref(),
            config::DEFAULT_JOB_TIMEOUT_SECS,
        )))
    }

    /// Append one attempt's record to the job's log file.
    async fn append_job_log(&self, job: &Job, outcome: &ExecOutcome) -> std::io::Result<()> {
        let entry = if outcome.timed_out {
            format!(
                "[{}] TIMEOUT {} for command: {}\n\n",
                clock::now_iso(),
                outcome.stderr,
                job.command
            )
        } else {
            format!(
                "[{}] EXIT={}\nSTDOUT\n{}\nSTDERR\n{}\n\n",
                clock::now_iso(),
                outcome.exit_code,
                outcome.stdout,
                outcome.stderr
            )
        };

        tokio::fs::create_dir_all(&self.log_dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(paths::job_log_file(&self.log_dir, &job.id))
            .await?;
        file.write_all(entry.as_bytes()).await
    }
}

/// Body of a worker process: pid file, signal handling, loop, cleanup.
pub async fn run_worker_process(db: &Path) -> Result<()> {
    paths::ensure_dirs().context("failed to create state directories")?;

    let shutdown = ShutdownFlag::new();
    shutdown
        .listen_for_signals()
        .context("failed to install signal handlers")?;

    let store = SqliteStore::connect(db).await?;
    let worker_id = std::process::id().to_string();

    let pid_file = paths::pid_file(&worker_id);
    std::fs::write(&pid_file, &worker_id)
        .with_context(|| format!("failed to write {}", pid_file.display()))?;

    let result = Worker::new(store, worker_id.as_str(), shutdown).run().await;
    let _ = std::fs::remove_file(&pid_file);
    result
}
