//! Shell execution of job commands.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;

/// Synthetic exit code for a timed-out execution, mirroring timeout(1).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Outcome of one execution attempt.
#[derive(Debug)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Error string fed to the retry engine: stderr when present, a
    /// synthesized `exit code N` otherwise.
    pub fn error_message(&self) -> String {
        if self.stderr.is_empty() {
            format!("exit code {}", self.exit_code)
        } else {
            self.stderr.clone()
        }
    }
}

/// Run `command` through the host shell, bounded by `timeout_secs`.
///
/// A timeout of `None` or a value at or below zero means unbounded. On
/// timeout the child is killed and the outcome carries exit code 124 with
/// `timeout after Ns` as its stderr.
pub async fn run_command(command: &str, timeout_secs: Option<i64>) -> Result<ExecOutcome> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().context("failed to spawn shell")?;

    let limit = timeout_secs
        .filter(|t| *t > 0)
        .map(|t| Duration::from_secs(t.unsigned_abs()));

    let output = match limit {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(done) => done.context("failed to collect command output")?,
            // The timed-out wait drops the child; kill_on_drop reaps it.
            Err(_elapsed) => {
                return Ok(ExecOutcome {
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!("timeout after {}s", limit.as_secs()),
                    timed_out: true,
                });
            }
        },
        None => child
            .wait_with_output()
            .await
            .context("failed to collect command output")?,
    };

    Ok(ExecOutcome {
        // A None code means death by signal.
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        timed_out: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let ok = run_command("echo out; echo err >&2", None).await.unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout, "out\n");
        assert_eq!(ok.stderr, "err\n");
        assert!(!ok.timed_out);

        let failed = run_command("exit 7", None).await.unwrap();
        assert_eq!(failed.exit_code, 7);
        assert!(!failed.success());
    }

    #[tokio::test]
    async fn zero_timeout_means_unbounded() {
        let outcome = run_command("true", Some(0)).await.unwrap();
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn timeout_synthesizes_exit_124() {
        let outcome = run_command("sleep 5", Some(1)).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(outcome.stderr, "timeout after 1s");
        assert_eq!(outcome.error_message(), "timeout after 1s");
    }

    #[tokio::test]
    async fn empty_stderr_synthesizes_exit_code_message() {
        let outcome = run_command("exit 3", None).await.unwrap();
        assert_eq!(outcome.error_message(), "exit code 3");

        let outcome = run_command("echo broken >&2; exit 3", None).await.unwrap();
        assert_eq!(outcome.error_message(), "broken\n");
    }
}
