//! # queuectl-core
//!
//! Core types and policies for the queuectl background job queue: the job
//! state machine, the durable store seam, and the retry/backoff/dead-letter
//! policy. Storage and process concerns live in sibling crates.
//!
//! ## Architecture
//!
//! ```text
//! CLI ──enqueue──► JobStore (durable, shared by all workers)
//!                     │
//!        claim_next   │   ▲ mark_completed / mark_retry / move_to_dlq
//!                     ▼   │
//!                 Worker loop ──► sh -c <command> (bounded by timeout)
//! ```
//!
//! ## Key Invariants
//!
//! 1. A `processing` job always has a `worker_id`; any other state never does
//! 2. A job id appears in at most one of the jobs table and the DLQ
//! 3. A transition past the retry ceiling ends in a DLQ entry, never a retained job row
//! 4. A completed job is terminal
//!
//! The store is the only coordination point between worker processes: the
//! claim transition is atomic, so two workers can never both move the same
//! row out of `pending`.

pub mod clock;
pub mod config;
mod error;
mod job;
mod retry;
mod store;

// Re-export error types
pub use error::QueueError;

// Re-export the job model and ingest format
pub use job::{DlqEntry, Job, JobSpec, JobState, QueueCounts};

// Re-export the retry policy
pub use retry::{decide_failure, truncate_error, FailureOutcome, MAX_ERROR_BYTES};

// Re-export the store seam
pub use store::JobStore;
