//! Error types shared across the queue crates.

/// Errors surfaced by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Enqueue of an id that already exists in the jobs table.
    #[error("job {0} already exists")]
    DuplicateJob(String),

    /// DLQ operation on an id with no DLQ entry.
    #[error("job {0} not found in DLQ")]
    NotInDlq(String),

    /// The ingest payload was not a valid job spec.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    /// A state string outside the recognized set.
    #[error("unknown job state: {0}")]
    UnknownState(String),

    /// Anything the durable store reports that has no dedicated variant.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
