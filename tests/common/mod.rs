#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use playlist_dedup::api::mock::{track, MockPlaylistApi};
use playlist_dedup::api::{Page, PlaylistApi, RemovalEntry, TrackInfo};
use playlist_dedup::config::Config;
use playlist_dedup::credentials::{
    Credential, CredentialManager, MemoryCredentialStore, RefreshedToken, TokenExchanger,
};
use playlist_dedup::executor::RequestExecutor;
use playlist_dedup::{CallError, SyncError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Token exchanger that hands out "fresh-N" tokens, optionally slowly or not at all.
pub struct CountingExchanger {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub reject: bool,
}

impl CountingExchanger {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            reject: false,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::new()
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenExchanger for CountingExchanger {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, SyncError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.reject {
            return Err(SyncError::Auth(format!("refresh token {} revoked", refresh_token)));
        }
        Ok(RefreshedToken {
            access_token: format!("fresh-{}", n),
            expires_in_secs: 3600,
        })
    }
}

pub fn credential_expiring_in(secs: i64) -> Credential {
    Credential {
        access_token: "initial".into(),
        refresh_token: "refresh-1".into(),
        expires_at_ms: Utc::now().timestamp_millis() + secs * 1000,
    }
}

/// Executor over a credential that stays valid for an hour.
pub fn valid_executor() -> Arc<RequestExecutor> {
    let store = Arc::new(MemoryCredentialStore::new(None));
    let manager = CredentialManager::new(
        credential_expiring_in(3600),
        store,
        Arc::new(CountingExchanger::new()),
        Duration::from_secs(60),
    );
    Arc::new(RequestExecutor::new(Arc::new(manager), Duration::from_secs(1)))
}

/// Builds tracks from a pattern like "ABACB": same letter, same track.
pub fn tracks(pattern: &str) -> Vec<TrackInfo> {
    pattern
        .chars()
        .map(|c| {
            let uri = format!("spotify:track:{}", c);
            let name = format!("Song {}", c);
            track(&uri, &name, &["Artist"])
        })
        .collect()
}

/// Letters currently in the mock playlist, in order; `_` marks an unavailable slot.
pub fn letters(api: &MockPlaylistApi, playlist_id: &str) -> String {
    api.uris(playlist_id)
        .iter()
        .map(|u| {
            if u.is_empty() {
                "_".to_string()
            } else {
                u.trim_start_matches("spotify:track:").to_string()
            }
        })
        .collect()
}

pub fn test_config() -> Config {
    Config::default()
}

/// Appends a track behind the reader's back during the first page read.
pub struct MovingPlaylist {
    pub inner: MockPlaylistApi,
    edited: AtomicBool,
}

impl MovingPlaylist {
    pub fn new(inner: MockPlaylistApi) -> Self {
        Self {
            inner,
            edited: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PlaylistApi for MovingPlaylist {
    fn name(&self) -> &str {
        "moving"
    }

    async fn fetch_page(&self, token: &str, playlist_id: &str, offset: usize, limit: usize) -> Result<Page, CallError> {
        if !self.edited.swap(true, Ordering::SeqCst) {
            self.inner
                .external_edit(playlist_id, |slots| slots.push(Some(track("spotify:track:Z", "Z", &["Other"]))));
        }
        self.inner.fetch_page(token, playlist_id, offset, limit).await
    }

    async fn snapshot_id(&self, token: &str, playlist_id: &str) -> Result<Option<String>, CallError> {
        self.inner.snapshot_id(token, playlist_id).await
    }

    async fn remove_occurrences(
        &self,
        token: &str,
        playlist_id: &str,
        entries: &[RemovalEntry],
        snapshot_id: Option<&str>,
    ) -> Result<Option<String>, CallError> {
        self.inner.remove_occurrences(token, playlist_id, entries, snapshot_id).await
    }

    async fn append(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<Option<String>, CallError> {
        self.inner.append(token, playlist_id, uris).await
    }
}
