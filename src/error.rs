use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the dedup engine to its caller.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The refresh exchange was rejected (revoked or invalid refresh token,
    /// bad client credentials). Fatal, never retried.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Non-throttling API failure.
    #[error("remote call failed with status {status}: {body}")]
    Remote { status: u16, body: String },

    /// The collection changed since the snapshot the plan was built from.
    #[error("collection changed since snapshot {expected:?}; re-fetch required")]
    StaleSnapshot { expected: Option<String> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("credential store error: {0}")]
    Store(String),

    #[error("invalid mutation plan: {0}")]
    InvalidPlan(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Short machine-friendly label, used in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Auth(_) => "auth",
            SyncError::Remote { .. } => "remote",
            SyncError::StaleSnapshot { .. } => "stale_snapshot",
            SyncError::Transport(_) => "transport",
            SyncError::Store(_) => "store",
            SyncError::InvalidPlan(_) => "invalid_plan",
            SyncError::Config(_) => "config",
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, SyncError::StaleSnapshot { .. })
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Store(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Store(format!("blocking task failed: {}", e))
    }
}

/// Outcome of a single remote call as seen by the request executor.
///
/// `Throttled` is the throttle signal: the executor sleeps and retries on it
/// and it never reaches callers of the executor.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("throttled (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    #[error("status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("snapshot mismatch: {body}")]
    StaleSnapshot { expected: Option<String>, body: String },

    #[error("transport: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        CallError::Transport(e.to_string())
    }
}
