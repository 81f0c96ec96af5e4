use crate::credentials::CredentialManager;
use crate::error::{CallError, SyncError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Single chokepoint for remote calls: obtains a valid access token, runs the
/// call and waits out throttling responses. Only `CallError::Throttled` is
/// retried, and it is retried for as long as the service keeps sending it.
pub struct RequestExecutor {
    credentials: Arc<CredentialManager>,
    default_wait: Duration,
    throttle_retries: AtomicU64,
}

impl RequestExecutor {
    pub fn new(credentials: Arc<CredentialManager>, default_wait: Duration) -> Self {
        Self {
            credentials,
            default_wait,
            throttle_retries: AtomicU64::new(0),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    /// Throttle retries performed since construction.
    pub fn throttle_retries(&self) -> u64 {
        self.throttle_retries.load(Ordering::SeqCst)
    }

    /// Run `call` with a fresh access token. `label` names the call in logs.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, SyncError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let token = self.credentials.ensure_valid().await?;
            match call(token).await {
                Ok(v) => {
                    if attempt > 1 {
                        debug!(call = label, attempt, "call succeeded after throttling");
                    }
                    return Ok(v);
                }
                Err(CallError::Throttled { retry_after }) => {
                    let wait = retry_after.unwrap_or(self.default_wait);
                    self.throttle_retries.fetch_add(1, Ordering::SeqCst);
                    warn!(call = label, attempt, wait_secs = wait.as_secs_f64(), "rate limited, waiting before retry");
                    tokio::time::sleep(wait).await;
                }
                Err(CallError::Status { status, body }) => {
                    return Err(SyncError::Remote { status, body });
                }
                Err(CallError::StaleSnapshot { expected, body }) => {
                    debug!(call = label, body = %body, "snapshot rejected by service");
                    return Err(SyncError::StaleSnapshot { expected });
                }
                Err(CallError::Transport(msg)) => {
                    return Err(SyncError::Transport(msg));
                }
            }
        }
    }
}
