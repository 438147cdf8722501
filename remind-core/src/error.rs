use std::time::Duration;

use thiserror::Error;

/// Failures raised by the repositories.
///
/// `Unavailable` means nothing was written: every multi-row operation runs in
/// a transaction that rolls back on error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("record {0} not found")]
    NotFound(i64),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Outcome of a failed SMS gateway call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Timeouts, 5xx, throttling. Safe to retry after backoff.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// Invalid recipient, unsubscribed number, bad credentials. Never retried.
    #[error("permanent gateway error: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to encode delivery job: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to publish delivery job: {0}")]
    Publish(String),

    #[error("delivery queue closed")]
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("reaper timeout {timeout:?} must exceed the worst-case retry sequence {budget:?}")]
    ReaperTooShort { timeout: Duration, budget: Duration },

    #[error("claim staleness {staleness:?} must exceed the worst-case retry sequence {budget:?}")]
    StalenessTooShort { staleness: Duration, budget: Duration },
}
