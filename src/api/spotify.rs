use super::{Page, PageEntry, PlaylistApi, RemovalEntry, TrackInfo};
use crate::error::CallError;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde_json::json;
use std::env;
use std::time::Duration;
use url::Url;

const TRACK_FIELDS: &str = "items(track(uri,name,artists(name)))";

/// Playlist access backed by the Spotify Web API.
/// The base URL may be overridden by the SPOTIFY_API_BASE env var or
/// `with_api_base` (useful for tests).
pub struct SpotifyPlaylistApi {
    client: Client,
    api_base: String,
}

impl Default for SpotifyPlaylistApi {
    fn default() -> Self {
        Self::new()
    }
}

impl SpotifyPlaylistApi {
    pub fn new() -> Self {
        // include v1 path by default
        let api_base = env::var("SPOTIFY_API_BASE").unwrap_or_else(|_| "https://api.spotify.com/v1".into());
        Self::with_api_base(api_base)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn tracks_url(&self, playlist_id: &str) -> String {
        format!("{}/playlists/{}/tracks", self.api_base, urlencoding::encode(playlist_id))
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }
}

fn parse_retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Turn a non-success response into the matching `CallError`.
/// `sent_snapshot` is the version stamp the request carried, if any.
async fn check_response(resp: Response, sent_snapshot: Option<&str>) -> Result<Response, CallError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(CallError::Throttled {
            retry_after: parse_retry_after(&resp),
        });
    }
    let body = resp.text().await.unwrap_or_default();
    let snapshot_rejected = status == StatusCode::CONFLICT
        || status == StatusCode::PRECONDITION_FAILED
        || (status == StatusCode::BAD_REQUEST
            && sent_snapshot.is_some()
            && body.to_ascii_lowercase().contains("snapshot"));
    if snapshot_rejected {
        return Err(CallError::StaleSnapshot {
            expected: sent_snapshot.map(str::to_string),
            body,
        });
    }
    Err(CallError::Status {
        status: status.as_u16(),
        body,
    })
}

fn parse_page(j: &serde_json::Value) -> Page {
    let items = j["items"].as_array().map(|items| {
        items
            .iter()
            .map(|it| {
                let track = it["track"]["uri"].as_str().map(|uri| TrackInfo {
                    uri: uri.to_string(),
                    name: it["track"]["name"].as_str().unwrap_or("").to_string(),
                    artists: it["track"]["artists"]
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|x| x["name"].as_str().map(|s| s.to_string()))
                                .collect()
                        })
                        .unwrap_or_default(),
                });
                PageEntry { track }
            })
            .collect()
    });
    Page { items }
}

#[async_trait]
impl PlaylistApi for SpotifyPlaylistApi {
    fn name(&self) -> &str {
        "spotify"
    }

    async fn fetch_page(&self, token: &str, playlist_id: &str, offset: usize, limit: usize) -> Result<Page, CallError> {
        let mut url = Url::parse(&self.tracks_url(playlist_id))
            .map_err(|e| CallError::Transport(format!("bad url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string())
            .append_pair("fields", TRACK_FIELDS);
        debug!("GET {}", url);
        let resp = self
            .client
            .get(url.as_str())
            .header(AUTHORIZATION, Self::bearer(token))
            .send()
            .await?;
        let resp = check_response(resp, None).await?;
        let j: serde_json::Value = resp.json().await?;
        Ok(parse_page(&j))
    }

    async fn snapshot_id(&self, token: &str, playlist_id: &str) -> Result<Option<String>, CallError> {
        let url = format!(
            "{}/playlists/{}?fields=snapshot_id",
            self.api_base,
            urlencoding::encode(playlist_id)
        );
        let resp = self
            .client
            .get(&url)
            .header(AUTHORIZATION, Self::bearer(token))
            .send()
            .await?;
        let resp = check_response(resp, None).await?;
        let j: serde_json::Value = resp.json().await?;
        Ok(j["snapshot_id"].as_str().map(|s| s.to_string()))
    }

    async fn remove_occurrences(
        &self,
        token: &str,
        playlist_id: &str,
        entries: &[RemovalEntry],
        snapshot_id: Option<&str>,
    ) -> Result<Option<String>, CallError> {
        let mut body = json!({ "tracks": entries });
        if let Some(s) = snapshot_id {
            body["snapshot_id"] = json!(s);
        }
        let resp = self
            .client
            .delete(self.tracks_url(playlist_id))
            .header(AUTHORIZATION, Self::bearer(token))
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = check_response(resp, snapshot_id).await?;
        Ok(snapshot_from_body(resp, playlist_id).await)
    }

    async fn append(&self, token: &str, playlist_id: &str, uris: &[String]) -> Result<Option<String>, CallError> {
        let body = json!({ "uris": uris });
        let resp = self
            .client
            .post(self.tracks_url(playlist_id))
            .header(AUTHORIZATION, Self::bearer(token))
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = check_response(resp, None).await?;
        Ok(snapshot_from_body(resp, playlist_id).await)
    }
}

/// New snapshot id from a successful edit; a body that is not JSON is logged
/// and the edit treated as unversioned.
async fn snapshot_from_body(resp: Response, playlist_id: &str) -> Option<String> {
    match resp.json::<serde_json::Value>().await {
        Ok(j) => j["snapshot_id"].as_str().map(|s| s.to_string()),
        Err(e) => {
            warn!("playlist {}: edit succeeded but response body was unreadable: {}", playlist_id, e);
            None
        }
    }
}
