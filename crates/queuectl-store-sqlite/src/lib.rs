//! SQLite implementation of the queuectl job store.
//!
//! This crate provides the embedded single-node implementation of the
//! `JobStore` trait from `queuectl-core`. Every worker process on the host
//! shares one database file; the store's transaction discipline is the only
//! synchronization between them.
//!
//! # Features
//!
//! - Immediate-transaction claiming: two racing workers can never both move
//!   the same row out of `pending`
//! - Write-ahead logging so readers proceed while a writer commits
//! - Dead letter queue table for permanently failed jobs
//! - Idempotent schema initialization with bounded retry under startup
//!   contention
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id TEXT PRIMARY KEY,
//!     command TEXT NOT NULL,
//!     state TEXT NOT NULL CHECK(state IN ('pending','processing','completed','failed','dead')),
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_retries INTEGER NOT NULL DEFAULT 3,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     run_at TEXT NOT NULL,
//!     last_error TEXT,
//!     priority INTEGER NOT NULL DEFAULT 100,
//!     timeout INTEGER,
//!     worker_id TEXT
//! );
//!
//! CREATE INDEX idx_jobs_state_runat ON jobs(state, run_at);
//! CREATE INDEX idx_jobs_priority ON jobs(priority, created_at);
//!
//! CREATE TABLE dlq (
//!     id TEXT PRIMARY KEY,
//!     command TEXT NOT NULL,
//!     attempts INTEGER NOT NULL,
//!     max_retries INTEGER NOT NULL,
//!     failed_at TEXT NOT NULL,
//!     last_error TEXT
//! );
//!
//! CREATE TABLE config (
//!     key TEXT PRIMARY KEY,
//!     value TEXT NOT NULL
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use queuectl_store_sqlite::SqliteStore;
//!
//! let store = SqliteStore::connect(Path::new("queuectl.db")).await?;
//! if let Some(job) = store.claim_next("4242", Utc::now()).await? {
//!     // execute, then mark_completed / mark_retry / move_to_dlq
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use queuectl_core::{
    clock, config, DlqEntry, Job, JobState, JobStore, QueueCounts, QueueError,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    state TEXT NOT NULL CHECK(state IN ('pending','processing','completed','failed','dead')),
    attempts INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    run_at TEXT NOT NULL,
    last_error TEXT,
    priority INTEGER NOT NULL DEFAULT 100,
    timeout INTEGER,
    worker_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_state_runat ON jobs(state, run_at);
CREATE INDEX IF NOT EXISTS idx_jobs_priority ON jobs(priority, created_at);

CREATE TABLE IF NOT EXISTS dlq (
    id TEXT PRIMARY KEY,
    command TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    failed_at TEXT NOT NULL,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQLite job store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and initialize the
    /// schema idempotently.
    ///
    /// The database runs in WAL mode with `synchronous = NORMAL` and a 30 s
    /// busy timeout, so short write contention blocks instead of erroring.
    pub async fn connect(path: &Path) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(store_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Schema init races with sibling workers on first start; the loser sees
    /// a locked database. Retried with linearly increasing sleep, 8 attempts.
    async fn init_schema(&self) -> Result<(), QueueError> {
        let mut attempt: u32 = 0;
        loop {
            match self.apply_schema().await {
                Ok(()) => return Ok(()),
                Err(e) if is_locked(&e) && attempt < 7 => {
                    attempt += 1;
                    debug!(attempt, "schema init hit a locked database, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(e) => return Err(store_err(e)),
            }
        }
    }

    async fn apply_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        for (key, value) in config::DEFAULTS {
            sqlx::query("INSERT OR IGNORE INTO config(key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: &Job) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs(id, command, state, attempts, max_retries,
                             created_at, updated_at, run_at, last_error,
                             priority, timeout, worker_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(&job.created_at)
        .bind(&job.updated_at)
        .bind(&job.run_at)
        .bind(&job.last_error)
        .bind(job.priority)
        .bind(job.timeout)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if matches!(db.kind(), ErrorKind::UniqueViolation) => {
                Err(QueueError::DuplicateJob(job.id.clone()))
            }
            Err(e) => Err(store_err(e)),
        }
    }

    /// Claim inside `BEGIN IMMEDIATE` so the select and the transition see a
    /// consistent row and racing claimants serialize on the write lock.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(store_err)?;

        match claim_in_tx(&mut conn, worker_id, now).await {
            Ok(claimed) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(store_err)?;
                Ok(claimed)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(store_err(e))
            }
        }
    }

    async fn mark_completed(&self, id: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE jobs SET state = 'completed', worker_id = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(clock::to_iso(now))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: &str,
        attempts: i64,
        run_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', attempts = ?, run_at = ?, last_error = ?,
                worker_id = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(clock::to_iso(run_at))
        .bind(last_error)
        .bind(clock::to_iso(now))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        id: &str,
        attempts: i64,
        failed_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO dlq(id, command, attempts, max_retries, failed_at, last_error)
            SELECT id, command, ?, max_retries, ?, ? FROM jobs WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(clock::to_iso(failed_at))
        .bind(last_error)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn dlq_promote(&self, id: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let now_s = clock::to_iso(now);
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let inserted = sqlx::query(
            r#"
            INSERT OR REPLACE INTO jobs(id, command, state, attempts, max_retries,
                                        created_at, updated_at, run_at, last_error,
                                        priority, timeout, worker_id)
            SELECT id, command, 'pending', 0, max_retries, ?, ?, ?, NULL, 100, NULL, NULL
            FROM dlq WHERE id = ?
            "#,
        )
        .bind(&now_s)
        .bind(&now_s)
        .bind(&now_s)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        if inserted.rows_affected() == 0 {
            return Err(QueueError::NotInDlq(id.to_string()));
        }

        sqlx::query("DELETE FROM dlq WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn config_get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| r.try_get("value")).transpose().map_err(store_err)
    }

    async fn config_set(&self, key: &str, value: &str) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO config(key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn config_all(&self) -> Result<Vec<(String, String)>, QueueError> {
        let rows = sqlx::query("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter()
            .map(|r| Ok((r.try_get("key")?, r.try_get("value")?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(store_err)
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>, QueueError> {
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT * FROM jobs WHERE state = ? ORDER BY created_at ASC")
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at ASC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(store_err)?;

        rows.iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(store_err)
    }

    async fn list_dlq(&self) -> Result<Vec<DlqEntry>, QueueError> {
        let rows = sqlx::query("SELECT * FROM dlq ORDER BY failed_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter()
            .map(dlq_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(store_err)
    }

    async fn dlq_get(&self, id: &str) -> Result<Option<DlqEntry>, QueueError> {
        let row = sqlx::query("SELECT * FROM dlq WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(dlq_from_row).transpose().map_err(store_err)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'pending') AS pending,
                COUNT(*) FILTER (WHERE state = 'processing') AS processing,
                COUNT(*) FILTER (WHERE state = 'completed') AS completed
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        let in_dlq: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dlq")
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(QueueCounts {
            pending: row.try_get("pending").map_err(store_err)?,
            processing: row.try_get("processing").map_err(store_err)?,
            completed: row.try_get("completed").map_err(store_err)?,
            in_dlq,
        })
    }
}

/// Lookups outside the `JobStore` seam.
impl SqliteStore {
    /// Fetch one job row.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(job_from_row).transpose().map_err(store_err)
    }
}

async fn claim_in_tx(
    conn: &mut SqliteConnection,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    let now_s = clock::to_iso(now);

    let row = sqlx::query(
        r#"
        SELECT * FROM jobs
        WHERE state = 'pending' AND run_at <= ?
        ORDER BY priority ASC, created_at ASC
        LIMIT 1
        "#,
    )
    .bind(&now_s)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut job = job_from_row(&row)?;

    let updated = sqlx::query(
        r#"
        UPDATE jobs SET state = 'processing', worker_id = ?, updated_at = ?
        WHERE id = ? AND state = 'pending'
        "#,
    )
    .bind(worker_id)
    .bind(&now_s)
    .bind(&job.id)
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() != 1 {
        return Ok(None);
    }

    job.state = JobState::Processing;
    job.worker_id = Some(worker_id.to_string());
    job.updated_at = now_s;
    Ok(Some(job))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, sqlx::Error> {
    let state: String = row.try_get("state")?;
    let state = state
        .parse::<JobState>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;

    Ok(Job {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        state,
        attempts: row.try_get("attempts")?,
        max_retries: row.try_get("max_retries")?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        run_at: row.try_get("run_at")?,
        last_error: row.try_get("last_error")?,
        timeout: row.try_get("timeout")?,
        worker_id: row.try_get("worker_id")?,
    })
}

fn dlq_from_row(row: &SqliteRow) -> Result<DlqEntry, sqlx::Error> {
    Ok(DlqEntry {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        attempts: row.try_get("attempts")?,
        max_retries: row.try_get("max_retries")?,
        failed_at: row.try_get("failed_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn is_locked(err: &sqlx::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

fn store_err(err: sqlx::Error) -> QueueError {
    QueueError::Store(err.into())
}
