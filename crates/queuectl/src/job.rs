//! Job domain model and the ingest format.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::clock;
use crate::error::QueueError;

/// Lifecycle states of a job row.
///
/// The engine's main path only produces `Pending`, `Processing`, and
/// `Completed`. `Failed` and `Dead` are accepted by the schema but never
/// written: a job that exhausts its retries is deleted from the jobs table
/// and recorded in the DLQ instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::UnknownState(other.to_string())),
        }
    }
}

/// A persisted job row.
///
/// Timestamps are RFC 3339 text in the storage format (see [`crate::clock`]).
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    /// Completed execution attempts; incremented after each failure.
    pub attempts: i64,
    pub max_retries: i64,
    /// Lower value wins; default 100.
    pub priority: i64,
    pub created_at: String,
    pub updated_at: String,
    /// Earliest instant at which the job may be claimed.
    pub run_at: String,
    pub last_error: Option<String>,
    /// Per-job timeout in seconds; `None` defers to the configured default.
    pub timeout: Option<i64>,
    /// Set while `state` is `Processing`, null otherwise.
    pub worker_id: Option<String>,
}

/// A dead letter queue entry. The id is the original job id.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub id: String,
    pub command: String,
    pub attempts: i64,
    pub max_retries: i64,
    pub failed_at: String,
    pub last_error: Option<String>,
}

/// Per-state totals for the status surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub in_dlq: i64,
}

/// Job spec as ingested from `enqueue --json` / `--file`.
///
/// Required keys: `id` and `command`. Everything else is defaulted at
/// enqueue time; unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub run_at: Option<String>,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub attempts: Option<i64>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl JobSpec {
    /// Parse a JSON payload into a spec. Rejects non-objects and payloads
    /// missing `id` or `command`.
    pub fn parse(json: &str) -> Result<Self, QueueError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| QueueError::InvalidSpec(e.to_string()))?;
        if !value.is_object() {
            return Err(QueueError::InvalidSpec(
                "payload must be a JSON object".to_string(),
            ));
        }
        serde_json::from_value(value).map_err(|e| QueueError::InvalidSpec(e.to_string()))
    }

    /// Materialize a job row, applying defaults. `default_max_retries`
    /// comes from config at enqueue time.
    ///
    /// User-supplied timestamps are normalized to the storage format, and
    /// `run_at` is floored at `created_at` so a job is never due before it
    /// exists.
    pub fn into_job(self, default_max_retries: i64, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let now_s = clock::to_iso(now);

        let created_at = normalize_ts(self.created_at, &now_s)?;
        let updated_at = normalize_ts(self.updated_at, &now_s)?;
        let mut run_at = normalize_ts(self.run_at, &now_s)?;
        if run_at < created_at {
            run_at = created_at.clone();
        }

        let state = match self.state {
            Some(s) => s.parse()?,
            None => JobState::Pending,
        };

        Ok(Job {
            id: self.id,
            command: self.command,
            state,
            attempts: self.attempts.unwrap_or(0),
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            priority: self.priority.unwrap_or(100),
            created_at,
            updated_at,
            run_at,
            last_error: self.last_error,
            timeout: self.timeout,
            worker_id: None,
        })
    }
}

fn normalize_ts(value: Option<String>, fallback: &str) -> Result<String, QueueError> {
    match value {
        Some(raw) => clock::parse_iso(&raw)
            .map(clock::to_iso)
            .map_err(|e| QueueError::InvalidSpec(format!("bad timestamp {raw:?}: {e}"))),
        None => Ok(fallback.to_string()),
    }
}
