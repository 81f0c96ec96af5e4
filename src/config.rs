use crate::error::SyncError;
use serde::Deserialize;
use std::path::PathBuf;

/// Hard ceiling the playlist API puts on page reads and item edits per call.
pub const SERVICE_MAX_ITEMS_PER_CALL: usize = 100;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemovalStrategy {
    /// One removal entry per occurrence.
    #[default]
    PerOccurrence,
    /// Merge occurrences of the same uri inside a batch into one entry with
    /// several positions. Only safe when the service applies the whole call
    /// against the snapshot atomically.
    GroupedPositions,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    // Spotify application credentials; fall back to the credentials table.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default)]
    pub default_playlist_id: Option<String>,

    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    #[serde(default = "default_retry_after")]
    pub default_retry_after_secs: u64,

    #[serde(default)]
    pub removal_strategy: RemovalStrategy,
    #[serde(default = "default_true")]
    pub use_consistency_token: bool,
    #[serde(default = "default_stale_replan_limit")]
    pub stale_replan_limit: u32,
}

fn default_db_path() -> PathBuf { "/var/lib/playlist-dedup/playlist-dedup.db".into() }
fn default_log_dir() -> PathBuf { "/var/log/playlist-dedup".into() }
fn default_page_size() -> usize { 100 }
fn default_max_batch_size() -> usize { 100 }
fn default_refresh_margin() -> u64 { 60 }
fn default_retry_after() -> u64 { 1 }
fn default_true() -> bool { true }
fn default_stale_replan_limit() -> u32 { 1 }

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_dir: default_log_dir(),
            client_id: None,
            client_secret: None,
            default_playlist_id: None,
            page_size: default_page_size(),
            max_batch_size: default_max_batch_size(),
            refresh_margin_secs: default_refresh_margin(),
            default_retry_after_secs: default_retry_after(),
            removal_strategy: RemovalStrategy::default(),
            use_consistency_token: default_true(),
            stale_replan_limit: default_stale_replan_limit(),
        }
    }
}

impl Config {
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.page_size == 0 || self.page_size > SERVICE_MAX_ITEMS_PER_CALL {
            return Err(SyncError::Config(format!(
                "page_size must be between 1 and {}, got {}",
                SERVICE_MAX_ITEMS_PER_CALL, self.page_size
            )));
        }
        if self.max_batch_size == 0 || self.max_batch_size > SERVICE_MAX_ITEMS_PER_CALL {
            return Err(SyncError::Config(format!(
                "max_batch_size must be between 1 and {}, got {}",
                SERVICE_MAX_ITEMS_PER_CALL, self.max_batch_size
            )));
        }
        Ok(())
    }
}
