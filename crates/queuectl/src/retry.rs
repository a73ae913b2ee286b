//! Retry and dead-letter policy.

use chrono::{DateTime, Duration, Utc};

/// Upper bound on stored error text, in bytes.
pub const MAX_ERROR_BYTES: usize = 8000;

/// Outcome of a failed execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Reschedule: the job goes back to `pending`, due at `run_at`.
    Retry {
        attempts: i64,
        run_at: DateTime<Utc>,
        last_error: String,
    },
    /// The retry ceiling is exceeded: the job row is deleted and a DLQ
    /// entry recorded in its place.
    DeadLetter {
        attempts: i64,
        failed_at: DateTime<Utc>,
        last_error: String,
    },
}

/// Decide what happens to a job whose execution attempt failed.
///
/// `attempts` is the count as the row was claimed. The retry delay grows as
/// `backoff_base ** next_attempts` seconds. The DLQ entry records one less
/// than the attempt number that tripped the ceiling, which is the count the
/// queue has always exposed.
pub fn decide_failure(
    attempts: i64,
    max_retries: i64,
    backoff_base: i64,
    now: DateTime<Utc>,
    error: &str,
) -> FailureOutcome {
    let next_attempts = attempts + 1;
    let last_error = truncate_error(error);

    if next_attempts > max_retries {
        return FailureOutcome::DeadLetter {
            attempts: next_attempts - 1,
            failed_at: now,
            last_error,
        };
    }

    let exp = u32::try_from(next_attempts).unwrap_or(u32::MAX);
    let delay = Duration::try_seconds(backoff_base.saturating_pow(exp)).unwrap_or(Duration::MAX);
    let run_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);

    FailureOutcome::Retry {
        attempts: next_attempts,
        run_at,
        last_error,
    }
}

/// Truncate an error string to [`MAX_ERROR_BYTES`], respecting char boundaries.
pub fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_BYTES {
        return error.to_string();
    }
    let mut end = MAX_ERROR_BYTES;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}
