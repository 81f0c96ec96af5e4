use serde::{Deserialize, Serialize};

/// One positional appearance of a track in a remote playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub uri: String,
    pub name: String,
    pub artists: Vec<String>,
    /// 0-based server index at fetch time.
    pub position: usize,
    /// False for slots the server returned without a track object
    /// (catalog-removed tracks, local files). They keep their position
    /// so later items stay aligned with server order.
    pub available: bool,
}

impl RemoteItem {
    pub fn new(uri: impl Into<String>, name: impl Into<String>, artists: Vec<String>, position: usize) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            artists,
            position,
            available: true,
        }
    }

    pub fn unavailable(position: usize) -> Self {
        Self {
            uri: String::new(),
            name: String::new(),
            artists: Vec::new(),
            position,
            available: false,
        }
    }
}

/// Why a snapshot may not reflect the full remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchWarning {
    /// A page came back without an item list; fetching stopped there.
    MalformedPage { offset: usize, fetched: usize },
    /// The consistency token moved while pages were being read.
    ChangedDuringFetch { before: Option<String>, after: Option<String> },
}

impl std::fmt::Display for FetchWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchWarning::MalformedPage { offset, fetched } => write!(
                f,
                "page at offset {} had no item list; snapshot holds only {} items",
                offset, fetched
            ),
            FetchWarning::ChangedDuringFetch { before, after } => write!(
                f,
                "collection changed while fetching ({:?} -> {:?})",
                before, after
            ),
        }
    }
}

/// Point-in-time view of a remote playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub collection_id: String,
    pub items: Vec<RemoteItem>,
    /// Server version stamp captured when the fetch completed.
    pub consistency_token: Option<String>,
    pub warning: Option<FetchWarning>,
}

impl CollectionSnapshot {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.warning.is_none()
    }

    pub fn item_at(&self, position: usize) -> Option<&RemoteItem> {
        self.items.get(position)
    }
}

/// Items sharing a grouping key, ascending by position. The first member is
/// the canonical occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub key: String,
    pub members: Vec<RemoteItem>,
}

impl DuplicateGroup {
    pub fn keep(&self) -> &RemoteItem {
        &self.members[0]
    }

    pub fn extras(&self) -> &[RemoteItem] {
        &self.members[1..]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DedupPolicy {
    /// Leave the first occurrence in place, remove the rest.
    #[default]
    KeepFirst,
    /// Remove every occurrence, then append one canonical copy per group.
    RestoreCanonical,
}

impl std::str::FromStr for DedupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-first" | "keep_first" => Ok(DedupPolicy::KeepFirst),
            "restore-canonical" | "restore_canonical" => Ok(DedupPolicy::RestoreCanonical),
            other => Err(format!("unknown policy '{}'", other)),
        }
    }
}
