//! Durable store seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::job::{DlqEntry, Job, JobState, QueueCounts};

/// Trait for the durable job store shared by every worker process.
///
/// Every mutating operation is a single atomic transaction: it either fully
/// applies or leaves no trace. Implementations serialize concurrent
/// writers; readers may proceed concurrently.
///
/// # Implementer Notes
///
/// - `claim_next` must pair its select and its `pending -> processing`
///   transition so two racing claimants cannot both win the same row
/// - The claim update must re-check `state = 'pending'` and report a zero-row
///   update as "nothing claimed"
/// - Schema initialization must be idempotent and retried under startup
///   contention
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly enqueued job. Fails with
    /// [`QueueError::DuplicateJob`] when the id already exists.
    async fn insert_job(&self, job: &Job) -> Result<(), QueueError>;

    /// Atomically claim the next due pending job for `worker_id`.
    ///
    /// Selection: `state = 'pending' AND run_at <= now`, ordered by
    /// ascending priority then ascending `created_at`. On success the row
    /// is `processing` and bound to `worker_id`. Returns `None` when
    /// nothing is due or a racing claimant won the row first.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError>;

    /// Transition a job to `completed` and clear its worker binding.
    async fn mark_completed(&self, id: &str, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Put a failed job back to `pending` for a later attempt.
    async fn mark_retry(
        &self,
        id: &str,
        attempts: i64,
        run_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Atomically delete a job row and record it in the DLQ. An existing
    /// DLQ entry with the same id is replaced.
    async fn move_to_dlq(
        &self,
        id: &str,
        attempts: i64,
        failed_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), QueueError>;

    /// Atomically move a DLQ entry back to the jobs table as fresh pending
    /// work: attempts 0, priority 100, due immediately. Fails with
    /// [`QueueError::NotInDlq`] when the id has no DLQ entry.
    async fn dlq_promote(&self, id: &str, now: DateTime<Utc>) -> Result<(), QueueError>;

    async fn config_get(&self, key: &str) -> Result<Option<String>, QueueError>;

    async fn config_set(&self, key: &str, value: &str) -> Result<(), QueueError>;

    /// All config rows, ordered by key.
    async fn config_all(&self) -> Result<Vec<(String, String)>, QueueError>;

    /// Jobs ordered by ascending `created_at`, optionally filtered by state.
    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>, QueueError>;

    /// DLQ entries, newest `failed_at` first.
    async fn list_dlq(&self) -> Result<Vec<DlqEntry>, QueueError>;

    /// Fetch one DLQ entry.
    async fn dlq_get(&self, id: &str) -> Result<Option<DlqEntry>, QueueError>;

    /// Per-state totals for the status surface.
    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}
