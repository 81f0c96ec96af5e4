use mockito::{Matcher, Server};
use playlist_dedup::api::spotify::SpotifyPlaylistApi;
use playlist_dedup::api::spotify_auth::SpotifyAuthClient;
use playlist_dedup::api::{PlaylistApi, RemovalEntry};
use playlist_dedup::credentials::{Credential, CredentialManager, MemoryCredentialStore, TokenExchanger};
use playlist_dedup::executor::RequestExecutor;
use playlist_dedup::fetcher::CollectionFetcher;
use playlist_dedup::{CallError, SyncError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

fn removal(uri: &str, positions: &[usize]) -> Vec<RemovalEntry> {
    vec![RemovalEntry {
        uri: uri.to_string(),
        positions: positions.to_vec(),
    }]
}

#[test]
fn fetch_page_sends_paging_query_and_bearer() {
    let mut server = Server::new();
    let m = server
        .mock("GET", "/playlists/pl1/tracks")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("offset".into(), "100".into()),
            Matcher::UrlEncoded("limit".into(), "100".into()),
            Matcher::UrlEncoded("fields".into(), "items(track(uri,name,artists(name)))".into()),
        ]))
        .match_header("authorization", "Bearer tok")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "items": [
                    { "track": { "uri": "spotify:track:1", "name": "One", "artists": [{ "name": "A" }] } },
                    { "track": null }
                ]
            })
            .to_string(),
        )
        .create();

    let api = SpotifyPlaylistApi::with_api_base(server.url());
    let page = runtime().block_on(api.fetch_page("tok", "pl1", 100, 100)).unwrap();

    m.assert();
    let items = page.items.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].track.as_ref().unwrap().name, "One");
    assert!(items[1].track.is_none());
}

#[test]
fn snapshot_id_is_read_from_playlist_fields() {
    let mut server = Server::new();
    let _m = server
        .mock("GET", "/playlists/pl1")
        .match_query(Matcher::UrlEncoded("fields".into(), "snapshot_id".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "snapshot_id": "abc" }).to_string())
        .create();

    let api = SpotifyPlaylistApi::with_api_base(server.url());
    let snap = runtime().block_on(api.snapshot_id("tok", "pl1")).unwrap();
    assert_eq!(snap.as_deref(), Some("abc"));
}

#[test]
fn removal_sends_positions_and_snapshot() {
    let mut server = Server::new();
    let m = server
        .mock("DELETE", "/playlists/pl1/tracks")
        .match_body(Matcher::Json(json!({
            "tracks": [{ "uri": "spotify:track:1", "positions": [3] }],
            "snapshot_id": "s1"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "snapshot_id": "s2" }).to_string())
        .create();

    let api = SpotifyPlaylistApi::with_api_base(server.url());
    let entries = removal("spotify:track:1", &[3]);
    let next = runtime()
        .block_on(api.remove_occurrences("tok", "pl1", &entries, Some("s1")))
        .unwrap();

    m.assert();
    assert_eq!(next.as_deref(), Some("s2"));
}

#[test]
fn append_posts_uris() {
    let mut server = Server::new();
    let m = server
        .mock("POST", "/playlists/pl1/tracks")
        .match_body(Matcher::Json(json!({ "uris": ["spotify:track:1", "spotify:track:2"] })))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(json!({ "snapshot_id": "s9" }).to_string())
        .create();

    let api = SpotifyPlaylistApi::with_api_base(server.url());
    let uris = vec!["spotify:track:1".to_string(), "spotify:track:2".to_string()];
    let next = runtime().block_on(api.append("tok", "pl1", &uris)).unwrap();

    m.assert();
    assert_eq!(next.as_deref(), Some("s9"));
}

#[test]
fn successful_edit_with_unreadable_body_has_no_new_snapshot() {
    let mut server = Server::new();
    let _removal = server
        .mock("DELETE", "/playlists/pl1/tracks")
        .with_status(200)
        .with_body("<html>ok</html>")
        .create();
    let _append = server
        .mock("POST", "/playlists/pl1/tracks")
        .with_status(201)
        .with_body("")
        .create();

    let api = SpotifyPlaylistApi::with_api_base(server.url());
    let rt = runtime();
    let entries = removal("spotify:track:1", &[0]);
    let next = rt
        .block_on(api.remove_occurrences("tok", "pl1", &entries, Some("s1")))
        .unwrap();
    assert_eq!(next, None);

    let next = rt.block_on(api.append("tok", "pl1", &["spotify:track:1".to_string()])).unwrap();
    assert_eq!(next, None);
}

#[test]
fn too_many_requests_becomes_throttle_signal() {
    let mut server = Server::new();
    let _m = server
        .mock("POST", "/playlists/pl1/tracks")
        .with_status(429)
        .with_header("retry-after", "3")
        .with_body(r#"{"error":"rate_limited"}"#)
        .create();

    let api = SpotifyPlaylistApi::with_api_base(server.url());
    let err = runtime()
        .block_on(api.append("tok", "pl1", &["spotify:track:1".to_string()]))
        .unwrap_err();
    match err {
        CallError::Throttled { retry_after } => assert_eq!(retry_after, Some(Duration::from_secs(3))),
        other => panic!("expected throttle, got {:?}", other),
    }
}

#[test]
fn snapshot_conflicts_are_reported_as_stale() {
    let mut server = Server::new();
    let _conflict = server
        .mock("DELETE", "/playlists/conflict/tracks")
        .with_status(409)
        .with_body("conflict")
        .create();
    let _bad_snapshot = server
        .mock("DELETE", "/playlists/bad/tracks")
        .with_status(400)
        .with_body(r#"{"error":{"status":400,"message":"Invalid snapshot id"}}"#)
        .create();

    let api = SpotifyPlaylistApi::with_api_base(server.url());
    let rt = runtime();
    let entries = removal("spotify:track:1", &[0]);

    let err = rt.block_on(api.remove_occurrences("tok", "conflict", &entries, Some("s1"))).unwrap_err();
    assert!(matches!(err, CallError::StaleSnapshot { expected: Some(ref s), .. } if s == "s1"));

    let err = rt.block_on(api.remove_occurrences("tok", "bad", &entries, Some("s1"))).unwrap_err();
    assert!(matches!(err, CallError::StaleSnapshot { .. }));

    // without a snapshot in the request the same 400 is an ordinary failure
    let err = rt.block_on(api.remove_occurrences("tok", "bad", &entries, None)).unwrap_err();
    assert!(matches!(err, CallError::Status { status: 400, .. }));
}

#[test]
fn token_refresh_uses_basic_auth_and_form_body() {
    let mut server = Server::new();
    let m = server
        .mock("POST", "/api/token")
        .match_header("authorization", "Basic Y2lkOmNzZWNyZXQ=")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "r-123".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "access_token": "new-access", "token_type": "Bearer", "expires_in": 1800 }).to_string())
        .create();

    let client = SpotifyAuthClient::with_auth_base("cid".into(), "csecret".into(), server.url());
    assert!(client.has_client_credentials());
    let refreshed = runtime().block_on(client.refresh("r-123")).unwrap();

    m.assert();
    assert_eq!(refreshed.access_token, "new-access");
    assert_eq!(refreshed.expires_in_secs, 1800);
}

#[test]
fn rejected_refresh_is_an_auth_error() {
    let mut server = Server::new();
    let _m = server
        .mock("POST", "/api/token")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(json!({ "error": "invalid_client" }).to_string())
        .create();

    let client = SpotifyAuthClient::with_auth_base("cid".into(), "bad".into(), server.url());
    let err = runtime().block_on(client.refresh("r-123")).unwrap_err();
    match err {
        SyncError::Auth(msg) => {
            assert!(msg.contains("400"), "{}", msg);
            assert!(msg.contains("invalid_client"), "{}", msg);
        }
        other => panic!("expected auth error, got {:?}", other),
    }
}

#[test]
fn expired_credential_is_refreshed_once_for_a_whole_fetch() {
    let mut server = Server::new();
    let token = server
        .mock("POST", "/api/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "access_token": "fresh", "expires_in": 3600 }).to_string())
        .expect(1)
        .create();
    let snapshot = server
        .mock("GET", "/playlists/pl1")
        .match_query(Matcher::UrlEncoded("fields".into(), "snapshot_id".into()))
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_body(json!({ "snapshot_id": "v1" }).to_string())
        .expect(2)
        .create();
    let page = server
        .mock("GET", "/playlists/pl1/tracks")
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_body(
            json!({
                "items": [
                    { "track": { "uri": "spotify:track:1", "name": "One", "artists": [{ "name": "A" }] } },
                    { "track": { "uri": "spotify:track:1", "name": "One", "artists": [{ "name": "A" }] } }
                ]
            })
            .to_string(),
        )
        .expect(1)
        .create();

    let base = server.url();
    let rt = runtime();
    let result = rt.block_on(async move {
        let expired = Credential {
            access_token: "stale".into(),
            refresh_token: "r-1".into(),
            expires_at_ms: 0,
        };
        let store = Arc::new(MemoryCredentialStore::new(None));
        let exchanger = Arc::new(SpotifyAuthClient::with_auth_base("cid".into(), "csecret".into(), base.clone()));
        let manager = Arc::new(CredentialManager::new(expired, store.clone(), exchanger, Duration::from_secs(60)));
        let executor = Arc::new(RequestExecutor::new(manager, Duration::from_secs(1)));
        let fetcher = CollectionFetcher::new(Arc::new(SpotifyPlaylistApi::with_api_base(base)), executor, 100);
        let snap = fetcher.fetch_all("pl1").await;
        (snap, store.stored())
    });

    let (snap, stored) = result;
    let snap = snap.unwrap();
    assert_eq!(snap.len(), 2);
    assert_eq!(snap.consistency_token.as_deref(), Some("v1"));
    assert_eq!(stored.unwrap().access_token, "fresh");
    token.assert();
    snapshot.assert();
    page.assert();
}
