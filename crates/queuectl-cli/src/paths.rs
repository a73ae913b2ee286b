//! Filesystem layout: the state directory with its pid and log subtrees.

use std::env;
use std::path::PathBuf;

/// Environment variable selecting the state directory.
pub const STATE_ENV: &str = "QUEUECTL_STATE";

/// State directory root (`QUEUECTL_STATE`, default `./.queuectl`).
pub fn state_dir() -> PathBuf {
    env::var_os(STATE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".queuectl"))
}

/// Directory holding one pid file per live worker.
pub fn pids_dir() -> PathBuf {
    state_dir().join("pids")
}

/// Directory holding one append-only log file per job id.
pub fn logs_dir() -> PathBuf {
    state_dir().join("logs")
}

pub fn pid_file(worker_id: &str) -> PathBuf {
    pids_dir().join(format!("worker.{worker_id}.pid"))
}

pub fn job_log_file(logs_dir: &std::path::Path, job_id: &str) -> PathBuf {
    logs_dir.join(format!("{job_id}.log"))
}

/// Create the state subtree if missing.
pub fn ensure_dirs() -> std::io::Result<()> {
    std::fs::create_dir_all(pids_dir())?;
    std::fs::create_dir_all(logs_dir())
}
