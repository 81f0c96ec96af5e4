use super::{Page, PageEntry, PlaylistApi, RemovalEntry, TrackInfo};
use crate::error::CallError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    FetchPage,
    SnapshotId,
    Remove,
    Append,
}

/// A scripted failure consumed by the next call of its kind.
#[derive(Debug, Clone)]
pub enum Fault {
    Throttle { retry_after_secs: Option<u64> },
    Status { status: u16, body: String },
    /// Page response without an item list (only meaningful for `FetchPage`).
    MissingItems,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    FetchPage { offset: usize, limit: usize },
    SnapshotId,
    Remove { entries: Vec<RemovalEntry>, snapshot_id: Option<String> },
    Append { uris: Vec<String> },
}

impl MockCall {
    pub fn kind(&self) -> CallKind {
        match self {
            MockCall::FetchPage { .. } => CallKind::FetchPage,
            MockCall::SnapshotId => CallKind::SnapshotId,
            MockCall::Remove { .. } => CallKind::Remove,
            MockCall::Append { .. } => CallKind::Append,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub playlist_id: String,
    pub token: String,
    pub call: MockCall,
}

#[derive(Default)]
struct MockPlaylist {
    slots: Vec<Option<TrackInfo>>,
    version: u64,
}

impl MockPlaylist {
    fn token(&self) -> String {
        format!("snap-{}", self.version)
    }
}

#[derive(Default)]
struct MockState {
    playlists: HashMap<String, MockPlaylist>,
    catalog: HashMap<String, TrackInfo>,
    // `None` lets one call of that kind through untouched.
    faults: HashMap<CallKind, VecDeque<Option<Fault>>>,
    calls: Vec<RecordedCall>,
}

/// In-memory playlist service with server-side position semantics.
///
/// Removal calls are applied atomically against the state before the call,
/// every listed position must hold the listed uri, and a supplied snapshot id
/// must match the current version.
#[derive(Default)]
pub struct MockPlaylistApi {
    state: Mutex<MockState>,
}

pub fn track(uri: &str, name: &str, artists: &[&str]) -> TrackInfo {
    TrackInfo {
        uri: uri.to_string(),
        name: name.to_string(),
        artists: artists.iter().map(|a| a.to_string()).collect(),
    }
}

impl MockPlaylistApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_playlist(self, playlist_id: &str, tracks: Vec<TrackInfo>) -> Self {
        self.set_playlist(playlist_id, tracks);
        self
    }

    pub fn set_playlist(&self, playlist_id: &str, tracks: Vec<TrackInfo>) {
        let mut st = self.state();
        for t in &tracks {
            st.catalog.insert(t.uri.clone(), t.clone());
        }
        st.playlists.insert(
            playlist_id.to_string(),
            MockPlaylist {
                slots: tracks.into_iter().map(Some).collect(),
                version: 1,
            },
        );
    }

    /// Insert an unavailable slot (no track object) at `position`.
    pub fn insert_unavailable(&self, playlist_id: &str, position: usize) {
        self.external_edit(playlist_id, |slots| {
            let at = position.min(slots.len());
            slots.insert(at, None);
        });
    }

    pub fn push_fault(&self, kind: CallKind, fault: Fault) {
        self.state().faults.entry(kind).or_default().push_back(Some(fault));
    }

    /// Let the next call of `kind` succeed before any queued fault applies.
    pub fn push_success(&self, kind: CallKind) {
        self.state().faults.entry(kind).or_default().push_back(None);
    }

    /// Mutate a playlist as another client would; bumps its version.
    pub fn external_edit(&self, playlist_id: &str, edit: impl FnOnce(&mut Vec<Option<TrackInfo>>)) {
        let mut st = self.state();
        if let Some(pl) = st.playlists.get_mut(playlist_id) {
            edit(&mut pl.slots);
            pl.version += 1;
        }
    }

    /// Current uris in order; unavailable slots show as an empty string.
    pub fn uris(&self, playlist_id: &str) -> Vec<String> {
        self.state()
            .playlists
            .get(playlist_id)
            .map(|pl| {
                pl.slots
                    .iter()
                    .map(|s| s.as_ref().map(|t| t.uri.clone()).unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn current_snapshot_id(&self, playlist_id: &str) -> Option<String> {
        self.state().playlists.get(playlist_id).map(|pl| pl.token())
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, kind: CallKind) -> usize {
        self.state().calls.iter().filter(|c| c.call.kind() == kind).count()
    }

    /// Entries of every removal call, in call order.
    pub fn removal_calls(&self) -> Vec<Vec<RemovalEntry>> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match &c.call {
                MockCall::Remove { entries, .. } => Some(entries.clone()),
                _ => None,
            })
            .collect()
    }

    /// Record the call and return a scripted fault if one is queued.
    fn begin(&self, token: &str, playlist_id: &str, call: MockCall) -> Option<Fault> {
        let mut st = self.state();
        let kind = call.kind();
        st.calls.push(RecordedCall {
            playlist_id: playlist_id.to_string(),
            token: token.to_string(),
            call,
        });
        st.faults.get_mut(&kind).and_then(|q| q.pop_front()).flatten()
    }
}

fn fault_to_error(fault: Fault) -> CallError {
    match fault {
        Fault::Throttle { retry_after_secs } => CallError::Throttled {
            retry_after: retry_after_secs.map(Duration::from_secs),
        },
        Fault::Status { status, body } => CallError::Status { status, body },
        Fault::MissingItems => CallError::Status {
            status: 500,
            body: "missing items".into(),
        },
    }
}

fn not_found(playlist_id: &str) -> CallError {
    CallError::Status {
        status: 404,
        body: format!("playlist {} not found", playlist_id),
    }
}

#[async_trait]
impl PlaylistApi for MockPlaylistApi {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_page(&self, token: &str, playlist_id: &str, offset: usize, limit: usize) -> Result<Page, CallError> {
        match self.begin(token, playlist_id, MockCall::FetchPage { offset, limit }) {
            Some(Fault::MissingItems) => return Ok(Page { items: None }),
            Some(f) => return Err(fault_to_error(f)),
            None => {}
        }
        let st = self.state();
        let pl = st.playlists.get(playlist_id).ok_or_else(|| not_found(playlist_id))?;
        let end = (offset + limit).min(pl.slots.len());
        let start = offset.min(end);
        let items = pl.slots[start..end]
            .iter()
            .map(|s| PageEntry { track: s.clone() })
            .collect();
        Ok(Page { items: Some(items) })
    }

    async fn snapshot_id(&self, token: &str, playlist_id: &str) -> Result<Option<String>, CallError> {
        if let Some(f) = self.begin(token, playlist_id, MockCall::SnapshotId) {
            return Err(fault_to_error(f));
        }
        let st = self.state();
        let pl = st.playlists.get(playlist_id).ok_or_else(|| not_found(playlist_id))?;
        Ok(Some(pl.token()))
    }

    async fn remove_occurrences(
        &self,
        token: &str,
        playlist_id: &str,
        entries: &[RemovalEntry],
        snapshot_id: Option<&str>,
    ) -> Result<Option<String>, CallError> {
        let call = MockCall::Remove {
            entries: entries.to_vec(),
            snapshot_id: snapshot_id.map(str::to_string),
        };
        if let Some(f) = self.begin(token, playlist_id, call) {
            return Err(fault_to_error(f));
        }
        let mut st = self.state();
        let pl = st.playlists.get_mut(playlist_id).ok_or_else(|| not_found(playlist_id))?;
        if let Some(expected) = snapshot_id {
            if expected != pl.token() {
                return Err(CallError::StaleSnapshot {
                    expected: Some(expected.to_string()),
                    body: format!("snapshot_id {} does not match {}", expected, pl.token()),
                });
            }
        }

        let mut positions: Vec<usize> = Vec::new();
        for entry in entries {
            for &pos in &entry.positions {
                let matches = pl
                    .slots
                    .get(pos)
                    .and_then(|s| s.as_ref())
                    .map(|t| t.uri == entry.uri)
                    .unwrap_or(false);
                if !matches || positions.contains(&pos) {
                    return Err(CallError::Status {
                        status: 400,
                        body: "Could not remove tracks, please check parameters.".into(),
                    });
                }
                positions.push(pos);
            }
        }
        positions.sort_unstable_by(|a, b| b.cmp(a));
        for pos in &positions {
            pl.slots.remove(*pos);
        }
        pl.version += 1;
        info!("MockPlaylistApi: removed {} occurrences from {}", positions.len(), playlist_id);
        Ok(Some(pl.token()))
    }

    async fn append(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<Option<String>, CallError> {
        if let Some(f) = self.begin(token, playlist_id, MockCall::Append { uris: uris.to_vec() }) {
            return Err(fault_to_error(f));
        }
        let mut st = self.state();
        let resolved: Vec<TrackInfo> = uris
            .iter()
            .map(|u| {
                st.catalog.get(u).cloned().unwrap_or_else(|| TrackInfo {
                    uri: u.clone(),
                    name: u.clone(),
                    artists: Vec::new(),
                })
            })
            .collect();
        let pl = st.playlists.get_mut(playlist_id).ok_or_else(|| not_found(playlist_id))?;
        pl.slots.extend(resolved.into_iter().map(Some));
        pl.version += 1;
        info!("MockPlaylistApi: appended {} tracks to {}", uris.len(), playlist_id);
        Ok(Some(pl.token()))
    }
}
