use crate::config::Config;
use crate::credentials::{RefreshedToken, TokenExchanger};
use crate::db;
use crate::error::SyncError;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Deserialize;
use std::env;
use tracing::debug;

/// Refresh-token exchange against the Spotify accounts service.
///
/// The initial authorization (browser consent, code exchange) happens
/// elsewhere; this client only trades an existing refresh token for a new
/// access token. The base URL may be overridden by SPOTIFY_AUTH_BASE.
pub struct SpotifyAuthClient {
    client: Client,
    client_id: String,
    client_secret: String,
    auth_base: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

impl SpotifyAuthClient {
    pub fn new(client_id: String, client_secret: String) -> Self {
        let auth_base = env::var("SPOTIFY_AUTH_BASE").unwrap_or_else(|_| "https://accounts.spotify.com".into());
        Self::with_auth_base(client_id, client_secret, auth_base)
    }

    pub fn with_auth_base(client_id: String, client_secret: String, auth_base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            client_id,
            client_secret,
            auth_base: auth_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Client credentials come from the config when set, otherwise from the
    /// credentials table.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let mut client_id = cfg.client_id.clone().unwrap_or_default();
        let mut client_secret = cfg.client_secret.clone().unwrap_or_default();
        if client_id.is_empty() || client_secret.is_empty() {
            let conn = db::open_or_create(&cfg.db_path)?;
            if let Some((_json, db_id, db_secret)) = db::load_credential_with_client(&conn, "spotify")? {
                if client_id.is_empty() {
                    client_id = db_id.unwrap_or_default();
                }
                if client_secret.is_empty() {
                    client_secret = db_secret.unwrap_or_default();
                }
            }
        }
        Ok(Self::new(client_id, client_secret))
    }

    pub fn has_client_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

#[async_trait]
impl TokenExchanger for SpotifyAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, SyncError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let auth_header = format!(
            "Basic {}",
            general_purpose::STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret))
        );
        let url = format!("{}/api/token", self.auth_base);
        debug!("POST {}", url);
        let resp = self
            .client
            .post(&url)
            .header(AUTHORIZATION, auth_header)
            .form(&params)
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Auth(format!("Failed to refresh token: {} - {}", status, body)));
        }
        let tr: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Auth(format!("unexpected token response: {}", e)))?;
        Ok(RefreshedToken {
            access_token: tr.access_token,
            expires_in_secs: tr.expires_in,
        })
    }
}
