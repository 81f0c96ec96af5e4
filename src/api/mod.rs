pub mod mock;
pub mod spotify;
pub mod spotify_auth;

use crate::error::CallError;
use serde::{Deserialize, Serialize};

/// One page of a playlist read.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// `None` when the response had no item list at all.
    pub items: Option<Vec<PageEntry>>,
}

/// A single playlist slot as returned by the service. `track` is absent for
/// unavailable entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageEntry {
    pub track: Option<TrackInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub uri: String,
    pub name: String,
    pub artists: Vec<String>,
}

/// One `{uri, positions}` element of a removal call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalEntry {
    pub uri: String,
    pub positions: Vec<usize>,
}

/// Remote ordered collection the engine edits. Every method performs exactly
/// one remote call with the supplied access token; retries and token refresh
/// are the caller's concern (see `executor::RequestExecutor`).
#[async_trait::async_trait]
pub trait PlaylistApi: Send + Sync {
    /// Provider name (for logging).
    fn name(&self) -> &str;

    /// Read `limit` entries starting at `offset`.
    async fn fetch_page(&self, token: &str, playlist_id: &str, offset: usize, limit: usize) -> Result<Page, CallError>;

    /// Current version stamp of the collection, if the service issues one.
    async fn snapshot_id(&self, token: &str, playlist_id: &str) -> Result<Option<String>, CallError>;

    /// Remove the given occurrences. When `snapshot_id` is set the service
    /// must reject the call if the collection moved past that version.
    /// Returns the new version stamp.
    async fn remove_occurrences(
        &self,
        token: &str,
        playlist_id: &str,
        entries: &[RemovalEntry],
        snapshot_id: Option<&str>,
    ) -> Result<Option<String>, CallError>;

    /// Append uris at the end of the collection. Returns the new version stamp.
    async fn append(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<Option<String>, CallError>;
}
