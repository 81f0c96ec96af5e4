use std::fs::File;
use std::io::Write;
use tempfile::tempdir;

use playlist_dedup::config::{Config, RemovalStrategy};
use playlist_dedup::db;

#[test]
fn config_from_path_parses_toml() {
    let td = tempdir().unwrap();
    let cfg_path = td.path().join("cfg.toml");
    let mut f = File::create(&cfg_path).unwrap();
    let toml = r#"
db_path = "/tmp/test.db"
log_dir = "/tmp"
default_playlist_id = "37i9dQZF1DX0XUsuxWHRQd"
max_batch_size = 50
removal_strategy = "grouped_positions"
"#;
    f.write_all(toml.as_bytes()).unwrap();
    let cfg = Config::from_path(&cfg_path).expect("parse config");
    assert_eq!(cfg.db_path.to_str().unwrap(), "/tmp/test.db");
    assert_eq!(cfg.default_playlist_id.as_deref(), Some("37i9dQZF1DX0XUsuxWHRQd"));
    assert_eq!(cfg.max_batch_size, 50);
    assert_eq!(cfg.removal_strategy, RemovalStrategy::GroupedPositions);
    // untouched fields keep their defaults
    assert_eq!(cfg.page_size, 100);
    assert_eq!(cfg.refresh_margin_secs, 60);
    assert_eq!(cfg.default_retry_after_secs, 1);
    assert!(cfg.use_consistency_token);
    assert_eq!(cfg.stale_replan_limit, 1);
}

#[test]
fn config_rejects_batch_size_above_service_limit() {
    let td = tempdir().unwrap();
    let cfg_path = td.path().join("cfg.toml");
    std::fs::write(&cfg_path, "max_batch_size = 101\n").unwrap();
    let err = Config::from_path(&cfg_path).unwrap_err();
    assert!(err.to_string().contains("max_batch_size"), "got: {}", err);

    std::fs::write(&cfg_path, "page_size = 0\n").unwrap();
    let err = Config::from_path(&cfg_path).unwrap_err();
    assert!(err.to_string().contains("page_size"), "got: {}", err);
}

#[test]
fn example_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/example-config.toml");
    Config::from_path(&path).expect("example config should parse");
}

#[test]
fn run_migrations_creates_tables() {
    let td = tempdir().unwrap();
    let db_path = td.path().join("test.db");
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    db::run_migrations(&conn).expect("run migrations");
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='credentials'")
        .unwrap();
    let mut rows = stmt.query([]).unwrap();
    let found = rows.next().unwrap().is_some();
    assert!(found, "credentials table should exist after migrations");
}

#[test]
fn saving_token_json_keeps_client_credentials() {
    let td = tempdir().unwrap();
    let db_path = td.path().join("nested").join("test.db");
    let conn = db::open_or_create(&db_path).unwrap();

    db::save_credential_raw(&conn, "spotify", r#"{"a":1}"#, Some("cid"), Some("secret")).unwrap();
    db::save_credential_raw(&conn, "spotify", r#"{"a":2}"#, None, None).unwrap();

    let (json, id, secret) = db::load_credential_with_client(&conn, "spotify").unwrap().unwrap();
    assert_eq!(json, r#"{"a":2}"#);
    assert_eq!(id.as_deref(), Some("cid"));
    assert_eq!(secret.as_deref(), Some("secret"));
    assert!(db::last_refreshed(&conn, "spotify").unwrap().is_some());
    assert!(db::load_credential_with_client(&conn, "deezer").unwrap().is_none());
}
