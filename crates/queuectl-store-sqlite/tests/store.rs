//! Integration tests for the SQLite job store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;
use tokio::task::JoinSet;

use queuectl_core::{clock, config, Job, JobSpec, JobState, JobStore, QueueError};
use queuectl_store_sqlite::SqliteStore;

async fn open_store(dir: &TempDir) -> SqliteStore {
    SqliteStore::connect(&dir.path().join("queue.db"))
        .await
        .expect("store should open")
}

fn pending_job(id: &str, priority: i64, created_at: &str, run_at: &str) -> Job {
    Job {
        id: id.to_string(),
        command: "true".to_string(),
        state: JobState::Pending,
        attempts: 0,
        max_retries: 3,
        priority,
        created_at: created_at.to_string(),
        updated_at: created_at.to_string(),
        run_at: run_at.to_string(),
        last_error: None,
        timeout: None,
        worker_id: None,
    }
}

fn simple_job(id: &str) -> Job {
    let now = clock::now_iso();
    pending_job(id, 100, &now, &now)
}

#[tokio::test]
async fn insert_rejects_duplicate_id() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    store.insert_job(&simple_job("a")).await.unwrap();
    let err = store.insert_job(&simple_job("a")).await.unwrap_err();
    assert!(matches!(err, QueueError::DuplicateJob(id) if id == "a"));
}

#[tokio::test]
async fn claim_orders_by_priority_then_created_at() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let now = Utc::now();
    let t0 = clock::to_iso(now - Duration::seconds(30));
    let t1 = clock::to_iso(now - Duration::seconds(20));
    let t2 = clock::to_iso(now - Duration::seconds(10));

    store.insert_job(&pending_job("late-low", 100, &t2, &t0)).await.unwrap();
    store.insert_job(&pending_job("old-high", 1, &t1, &t0)).await.unwrap();
    store.insert_job(&pending_job("older-high", 1, &t0, &t0)).await.unwrap();

    let first = store.claim_next("w", now).await.unwrap().unwrap();
    let second = store.claim_next("w", now).await.unwrap().unwrap();
    let third = store.claim_next("w", now).await.unwrap().unwrap();

    assert_eq!(first.id, "older-high");
    assert_eq!(second.id, "old-high");
    assert_eq!(third.id, "late-low");
    assert!(store.claim_next("w", now).await.unwrap().is_none());
}

#[tokio::test]
async fn claim_skips_jobs_not_yet_due() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let now = Utc::now();
    let created = clock::to_iso(now);
    let due_later = clock::to_iso(now + Duration::hours(1));

    store.insert_job(&pending_job("later", 1, &created, &due_later)).await.unwrap();

    assert!(store.claim_next("w", now).await.unwrap().is_none());
    let job = store
        .claim_next("w", now + Duration::hours(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, "later");
}

#[tokio::test]
async fn claim_binds_worker_and_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store.insert_job(&simple_job("a")).await.unwrap();

    let now = Utc::now();
    let claimed = store.claim_next("w1", now).await.unwrap().unwrap();
    assert_eq!(claimed.state, JobState::Processing);
    assert_eq!(claimed.worker_id.as_deref(), Some("w1"));

    let row = store.get_job("a").await.unwrap().unwrap();
    assert_eq!(row.state, JobState::Processing);
    assert_eq!(row.worker_id.as_deref(), Some("w1"));

    assert!(store.claim_next("w2", now).await.unwrap().is_none());
}

#[tokio::test]
async fn completed_jobs_are_terminal_and_unbound() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store.insert_job(&simple_job("a")).await.unwrap();

    let now = Utc::now();
    store.claim_next("w1", now).await.unwrap().unwrap();
    store.mark_completed("a", now).await.unwrap();

    let row = store.get_job("a").await.unwrap().unwrap();
    assert_eq!(row.state, JobState::Completed);
    assert!(row.worker_id.is_none());

    assert!(store.claim_next("w1", now + Duration::hours(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn retry_returns_job_to_pending_with_error() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store.insert_job(&simple_job("a")).await.unwrap();

    let now = Utc::now();
    store.claim_next("w1", now).await.unwrap().unwrap();
    let due = now + Duration::seconds(2);
    store.mark_retry("a", 1, due, "exit code 1", now).await.unwrap();

    let row = store.get_job("a").await.unwrap().unwrap();
    assert_eq!(row.state, JobState::Pending);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.run_at, clock::to_iso(due));
    assert_eq!(row.last_error.as_deref(), Some("exit code 1"));
    assert!(row.worker_id.is_none());

    assert!(store.claim_next("w1", now).await.unwrap().is_none());
    let reclaimed = store
        .claim_next("w1", now + Duration::seconds(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.attempts, 1);
}

#[tokio::test]
async fn dlq_move_removes_job_row() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store.insert_job(&simple_job("a")).await.unwrap();

    let now = Utc::now();
    store.claim_next("w1", now).await.unwrap().unwrap();
    store.move_to_dlq("a", 3, now, "boom").await.unwrap();

    assert!(store.get_job("a").await.unwrap().is_none());
    let entry = store.dlq_get("a").await.unwrap().unwrap();
    assert_eq!(entry.attempts, 3);
    assert_eq!(entry.max_retries, 3);
    assert_eq!(entry.command, "true");
    assert_eq!(entry.failed_at, clock::to_iso(now));
    assert_eq!(entry.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn dlq_entry_replaced_on_second_failure() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store.insert_job(&simple_job("a")).await.unwrap();

    let now = Utc::now();
    store.claim_next("w1", now).await.unwrap().unwrap();
    store.move_to_dlq("a", 3, now, "first").await.unwrap();

    store.dlq_promote("a", now).await.unwrap();
    let later = now + Duration::seconds(5);
    store.claim_next("w1", later).await.unwrap().unwrap();
    store.move_to_dlq("a", 3, later, "second").await.unwrap();

    let entries = store.list_dlq().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].last_error.as_deref(), Some("second"));
}

#[tokio::test]
async fn dlq_promote_restores_fresh_pending_job() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let mut job = simple_job("a");
    job.priority = 7;
    job.timeout = Some(15);
    store.insert_job(&job).await.unwrap();

    let now = Utc::now();
    store.claim_next("w1", now).await.unwrap().unwrap();
    store.move_to_dlq("a", 3, now, "boom").await.unwrap();

    let later = now + Duration::minutes(1);
    store.dlq_promote("a", later).await.unwrap();

    assert!(store.dlq_get("a").await.unwrap().is_none());
    let row = store.get_job("a").await.unwrap().unwrap();
    assert_eq!(row.state, JobState::Pending);
    assert_eq!(row.attempts, 0);
    assert_eq!(row.priority, 100);
    assert_eq!(row.run_at, clock::to_iso(later));
    assert!(row.last_error.is_none());
    assert!(row.timeout.is_none());
    assert!(row.worker_id.is_none());
}

#[tokio::test]
async fn dlq_promote_unknown_id_fails() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let err = store.dlq_promote("ghost", Utc::now()).await.unwrap_err();
    assert!(matches!(err, QueueError::NotInDlq(id) if id == "ghost"));
}

#[tokio::test]
async fn config_defaults_seeded_and_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    assert_eq!(
        store.config_get(config::MAX_RETRIES).await.unwrap().as_deref(),
        Some("3")
    );
    assert_eq!(
        store.config_get(config::BACKOFF_BASE).await.unwrap().as_deref(),
        Some("2")
    );
    assert_eq!(
        store.config_get(config::JOB_TIMEOUT).await.unwrap().as_deref(),
        Some("300")
    );
    assert!(store.config_get("missing").await.unwrap().is_none());

    store.config_set(config::BACKOFF_BASE, "5").await.unwrap();
    assert_eq!(
        store.config_get(config::BACKOFF_BASE).await.unwrap().as_deref(),
        Some("5")
    );

    let all = store.config_all().await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
}

#[tokio::test]
async fn reopening_preserves_data_and_config() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir).await;
        store.insert_job(&simple_job("a")).await.unwrap();
        store.config_set(config::MAX_RETRIES, "9").await.unwrap();
    }

    let store = open_store(&dir).await;
    assert!(store.get_job("a").await.unwrap().is_some());
    // Re-init must not clobber operator-set values back to defaults.
    assert_eq!(
        store.config_get(config::MAX_RETRIES).await.unwrap().as_deref(),
        Some("9")
    );
}

#[tokio::test]
async fn counts_reflect_every_surface() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let now = Utc::now();

    for id in ["a", "b", "c", "d"] {
        store.insert_job(&simple_job(id)).await.unwrap();
    }
    store.claim_next("w", now).await.unwrap().unwrap();

    let b = store.claim_next("w", now).await.unwrap().unwrap();
    store.mark_completed(&b.id, now).await.unwrap();

    let c = store.claim_next("w", now).await.unwrap().unwrap();
    store.move_to_dlq(&c.id, 1, now, "boom").await.unwrap();

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.processing, 1);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.in_dlq, 1);
}

#[tokio::test]
async fn list_jobs_filters_and_orders() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let now = Utc::now();
    let t0 = clock::to_iso(now - Duration::seconds(20));
    let t1 = clock::to_iso(now - Duration::seconds(10));

    store.insert_job(&pending_job("newer", 100, &t1, &t1)).await.unwrap();
    store.insert_job(&pending_job("older", 100, &t0, &t0)).await.unwrap();
    store.claim_next("w", now).await.unwrap().unwrap();

    let all = store.list_jobs(None).await.unwrap();
    assert_eq!(
        all.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(),
        vec!["older", "newer"]
    );

    let pending = store.list_jobs(Some(JobState::Pending)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "newer");

    let processing = store.list_jobs(Some(JobState::Processing)).await.unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].id, "older");
}

#[tokio::test]
async fn enqueue_ingest_spec_round_trips_through_store() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let spec = JobSpec::parse(r#"{"id":"ingest","command":"echo hi","priority":9}"#).unwrap();
    let job = spec.into_job(3, Utc::now()).unwrap();
    store.insert_job(&job).await.unwrap();

    let row = store.get_job("ingest").await.unwrap().unwrap();
    assert_eq!(row.command, "echo hi");
    assert_eq!(row.priority, 9);
    assert_eq!(row.state, JobState::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_claimants_never_double_claim() {
    const JOBS: usize = 60;
    const WORKERS: usize = 8;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir).await);
    let now = Utc::now();
    let created = clock::to_iso(now - Duration::seconds(1));

    for i in 0..JOBS {
        store
            .insert_job(&pending_job(&format!("job-{i}"), 100, &created, &created))
            .await
            .unwrap();
    }

    let mut tasks = JoinSet::new();
    for w in 0..WORKERS {
        let store = store.clone();
        let worker_id = format!("w{w}");
        tasks.spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match store.claim_next(&worker_id, Utc::now()).await {
                    Ok(Some(job)) => claimed.push(job.id),
                    Ok(None) => break,
                    // Busy-timeout expiry under heavy contention; poll again.
                    Err(_) => tokio::task::yield_now().await,
                }
            }
            claimed
        });
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    while let Some(claimed) = tasks.join_next().await {
        for id in claimed.unwrap() {
            assert!(seen.insert(id.clone()), "job {id} claimed twice");
            total += 1;
        }
    }
    assert_eq!(total, JOBS);

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.processing, JOBS as i64);
}
