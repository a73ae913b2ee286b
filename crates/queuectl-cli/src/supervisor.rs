//! Worker process lifecycle: spawn, enumerate, stop.
//!
//! Workers are spawned by re-invoking the current executable with the
//! hidden `worker run` subcommand. Each worker records its own pid file;
//! this module only reads the registry and signals the pids it finds.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::paths;

/// Stagger between spawns so children don't all race schema init.
const SPAWN_STAGGER: Duration = Duration::from_millis(50);

/// Spawn `count` detached worker processes against `db`; returns their pids.
pub async fn start_workers(db: &Path, count: u32) -> Result<Vec<u32>> {
    paths::ensure_dirs().context("failed to create state directories")?;
    let exe = std::env::current_exe().context("failed to resolve current executable")?;

    let mut pids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let child = Command::new(&exe)
            .arg("--db")
            .arg(db)
            .args(["worker", "run"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn worker process")?;
        debug!(pid = child.id(), "spawned worker");
        pids.push(child.id());
        tokio::time::sleep(SPAWN_STAGGER).await;
    }
    Ok(pids)
}

/// Pids recorded in the pid directory, alive or not.
pub fn recorded_pids() -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir(paths::pids_dir()) else {
        return Vec::new();
    };

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !(name.starts_with("worker.") && name.ends_with(".pid")) {
            continue;
        }
        if let Ok(text) = std::fs::read_to_string(entry.path()) {
            if let Ok(pid) = text.trim().parse::<u32>() {
                pids.push(pid);
            }
        }
    }
    pids.sort_unstable();
    pids
}

/// SIGTERM every recorded worker so it stops after its current job.
/// Returns how many pids were signaled; stale pid files are tolerated
/// silently (the kill simply finds no such process).
pub fn stop_workers() -> usize {
    let pids = recorded_pids();
    for pid in &pids {
        unsafe {
            libc::kill(*pid as libc::pid_t, libc::SIGTERM);
        }
    }
    pids.len()
}

/// `kill(pid, 0)` liveness probe.
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Recorded pids whose process is still running.
pub fn live_pids() -> Vec<u32> {
    recorded_pids().into_iter().filter(|p| pid_alive(*p)).collect()
}
