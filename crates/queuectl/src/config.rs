//! Config keys recognized by the engine.
//!
//! Config is a flat key/value table in the durable store. Values are read
//! at the point of use, not cached: a change takes effect on the next
//! enqueue, claim, or retry that consults it.

/// Default retry ceiling for jobs that omit `max_retries`.
pub const MAX_RETRIES: &str = "max_retries";

/// Integer base of the exponential backoff formula.
pub const BACKOFF_BASE: &str = "backoff_base";

/// Default per-execution wall-clock timeout in seconds. A value of zero
/// (or below) disables timeout enforcement.
pub const JOB_TIMEOUT: &str = "job_timeout";

pub const DEFAULT_MAX_RETRIES: i64 = 3;
pub const DEFAULT_BACKOFF_BASE: i64 = 2;
pub const DEFAULT_JOB_TIMEOUT_SECS: i64 = 300;

/// Rows seeded into a fresh store.
pub const DEFAULTS: &[(&str, &str)] = &[
    (MAX_RETRIES, "3"),
    (BACKOFF_BASE, "2"),
    (JOB_TIMEOUT, "300"),
];

/// Parse a config value as an integer, falling back when missing or malformed.
pub fn int_or(value: Option<&str>, fallback: i64) -> i64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(fallback)
}
