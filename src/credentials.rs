//! Access credential ownership and refresh.
//!
//! The credential lives inside [`CredentialManager`] and is only handed out
//! through [`CredentialManager::ensure_valid`]. The lock around it is held
//! for the whole refresh exchange, so callers that arrive while a refresh is
//! running wait for it and reuse its result instead of starting their own.

use crate::db;
use crate::error::SyncError;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch milliseconds. `expires_at` is accepted for older tokens.json files.
    #[serde(alias = "expires_at", default)]
    pub expires_at_ms: i64,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

impl Credential {
    /// True when the token stays usable for at least `margin` after `now_ms`.
    pub fn is_valid_at(&self, now_ms: i64, margin: Duration) -> bool {
        now_ms + margin.as_millis() as i64 <= self.expires_at_ms
    }
}

/// Result of a refresh exchange.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in_secs: i64,
}

/// Trades the refresh token for a new access token.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, SyncError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Credential>, SyncError>;
    async fn save(&self, credential: &Credential) -> Result<(), SyncError>;
}

/// Credential persisted as JSON in the `credentials` table.
pub struct SqliteCredentialStore {
    db_path: PathBuf,
    provider: String,
}

impl SqliteCredentialStore {
    pub fn new(db_path: PathBuf, provider: impl Into<String>) -> Self {
        Self {
            db_path,
            provider: provider.into(),
        }
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load(&self) -> Result<Option<Credential>, SyncError> {
        let db_path = self.db_path.clone();
        let provider = self.provider.clone();
        let json_opt = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<String>> {
            let conn = db::open_or_create(&db_path)?;
            Ok(db::load_credential_with_client(&conn, &provider)?.map(|(json, _, _)| json))
        })
        .await?
        .map_err(|e| SyncError::Store(e.to_string()))?;

        match json_opt {
            Some(s) => {
                let cred: Credential = serde_json::from_str(&s)
                    .map_err(|e| SyncError::Store(format!("parse credential json: {}", e)))?;
                Ok(Some(cred))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, credential: &Credential) -> Result<(), SyncError> {
        let db_path = self.db_path.clone();
        let provider = self.provider.clone();
        let s = serde_json::to_string(credential)
            .map_err(|e| SyncError::Store(e.to_string()))?;
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = db::open_or_create(&db_path)?;
            db::save_credential_raw(&conn, &provider, &s, None, None)?;
            Ok(())
        })
        .await?
        .map_err(|e| SyncError::Store(e.to_string()))
    }
}

/// In-process store; counts saves so callers can observe persistence.
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: std::sync::Mutex<Option<Credential>>,
    saves: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new(initial: Option<Credential>) -> Self {
        Self {
            inner: std::sync::Mutex::new(initial),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Option<Credential> {
        self.inner.lock().ok().and_then(|g| g.clone())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credential>, SyncError> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| SyncError::Store("memory store poisoned".into()))?;
        Ok(guard.clone())
    }

    async fn save(&self, credential: &Credential) -> Result<(), SyncError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| SyncError::Store("memory store poisoned".into()))?;
        *guard = Some(credential.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct CredentialManager {
    refresh_token: String,
    state: Mutex<Credential>,
    store: Arc<dyn CredentialStore>,
    exchanger: Arc<dyn TokenExchanger>,
    margin: Duration,
    refreshes: AtomicU64,
}

impl CredentialManager {
    pub fn new(
        initial: Credential,
        store: Arc<dyn CredentialStore>,
        exchanger: Arc<dyn TokenExchanger>,
        margin: Duration,
    ) -> Self {
        Self {
            refresh_token: initial.refresh_token.clone(),
            state: Mutex::new(initial),
            store,
            exchanger,
            margin,
            refreshes: AtomicU64::new(0),
        }
    }

    /// Build a manager from whatever the store currently holds.
    pub async fn load(
        store: Arc<dyn CredentialStore>,
        exchanger: Arc<dyn TokenExchanger>,
        margin: Duration,
    ) -> Result<Self, SyncError> {
        let initial = store.load().await?.ok_or_else(|| {
            SyncError::Auth("no stored credential; import tokens first".into())
        })?;
        if initial.refresh_token.is_empty() {
            return Err(SyncError::Auth("stored credential has no refresh token".into()));
        }
        Ok(Self::new(initial, store, exchanger, margin))
    }

    /// Return an access token valid for at least the safety margin,
    /// refreshing (once, for all concurrent callers) when needed.
    pub async fn ensure_valid(&self) -> Result<String, SyncError> {
        let mut guard = self.state.lock().await;
        let now = Utc::now().timestamp_millis();
        if guard.is_valid_at(now, self.margin) {
            return Ok(guard.access_token.clone());
        }

        debug!(
            expires_at_ms = guard.expires_at_ms,
            "access token expired or inside safety margin, refreshing"
        );
        let refreshed = self.exchanger.refresh(&self.refresh_token).await?;
        let next = Credential {
            access_token: refreshed.access_token,
            refresh_token: self.refresh_token.clone(),
            expires_at_ms: Utc::now().timestamp_millis() + refreshed.expires_in_secs * 1000,
        };
        self.store.save(&next).await?;
        *guard = next;
        self.refreshes.fetch_add(1, Ordering::SeqCst);

        let valid_until = Utc
            .timestamp_millis_opt(guard.expires_at_ms)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        info!(valid_until = %valid_until, "access token refreshed");
        Ok(guard.access_token.clone())
    }

    pub async fn current(&self) -> Credential {
        self.state.lock().await.clone()
    }

    /// Number of refresh exchanges performed by this manager.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

/// Seed a store from a tokens.json file
/// (`access_token`, `refresh_token`, `expires_at` in epoch millis).
pub async fn import_tokens_file(path: &Path, store: &dyn CredentialStore) -> Result<Credential, SyncError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SyncError::Store(format!("read {}: {}", path.display(), e)))?;
    let cred: Credential = serde_json::from_str(&raw)
        .map_err(|e| SyncError::Store(format!("parse {}: {}", path.display(), e)))?;
    if cred.refresh_token.is_empty() {
        return Err(SyncError::Auth("tokens file has no refresh_token".into()));
    }
    store.save(&cred).await?;
    Ok(cred)
}
