use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use playlist_dedup as lib;
use lib::api::spotify::SpotifyPlaylistApi;
use lib::api::spotify_auth::SpotifyAuthClient;
use lib::config::Config;
use lib::credentials::{self, CredentialManager, SqliteCredentialStore};
use lib::dedup::{detect_groups, redundant_count};
use lib::executor::RequestExecutor;
use lib::models::DedupPolicy;
use lib::sync::{AutoConfirm, ConfirmRequest, Confirmer, Deduplicator, SyncReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::subscriber as tracing_subscriber_global;
use tracing_appender::rolling::RollingFileAppender;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "playlist-dedup", version)]
struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find duplicate tracks and remove them
    Dedupe {
        /// Playlist id; repeat to process several playlists concurrently.
        /// Defaults to `default_playlist_id` from the config.
        #[arg(long = "playlist")]
        playlists: Vec<String>,

        /// keep-first or restore-canonical
        #[arg(long, default_value = "keep-first")]
        policy: DedupPolicy,

        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the playlist contents and its duplicate groups
    List {
        #[arg(long)]
        playlist: Option<String>,
    },
    /// Remove the tracks at the given 0-based positions
    Remove {
        #[arg(long)]
        playlist: Option<String>,

        #[arg(long, value_delimiter = ',', required = true)]
        positions: Vec<usize>,

        #[arg(long)]
        yes: bool,
    },
    /// Append track uris to the end of the playlist
    Add {
        #[arg(long)]
        playlist: Option<String>,

        #[arg(required = true)]
        uris: Vec<String>,
    },
    /// Store tokens from a tokens.json file (access_token, refresh_token, expires_at)
    ImportTokens {
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
    },
    /// Validate config file and exit
    ConfigValidate,
}

/// Prompts on the terminal before anything is changed.
struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, request: &ConfirmRequest<'_>) -> bool {
        let question = match request {
            ConfirmRequest::Dedup {
                collection_id,
                groups,
                policy,
                warning,
            } => {
                println!("Duplicates in {}:", collection_id);
                for g in groups.iter() {
                    let members: Vec<String> = g
                        .members
                        .iter()
                        .map(|m| format!("\"{}\" [pos:{}, uri:{}]", m.name, m.position, m.uri))
                        .collect();
                    println!(" - {}", members.join(", "));
                }
                if let Some(w) = warning {
                    println!("warning: {}", w);
                }
                match policy {
                    DedupPolicy::KeepFirst => "Remove all duplicates, keeping the first occurrence of each track?",
                    DedupPolicy::RestoreCanonical => "Remove every occurrence and append one copy of each track?",
                }
            }
            ConfirmRequest::RemoveSelected { collection_id, items } => {
                println!("Selected {} track(s) in {}:", items.len(), collection_id);
                for it in items.iter() {
                    println!(" - [{}] {} - {}", it.position, it.name, it.artists.join(", "));
                }
                "Remove the selected tracks?"
            }
        };
        println!("{} [y/N]", question);
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }
}

fn resolve_playlist(cfg: &Config, explicit: Option<String>) -> Result<String> {
    explicit
        .or_else(|| cfg.default_playlist_id.clone())
        .ok_or_else(|| anyhow!("no playlist given and no default_playlist_id in config"))
}

async fn build_deduplicator(cfg: &Config, confirmer: Arc<dyn Confirmer>) -> Result<Deduplicator> {
    let store = Arc::new(SqliteCredentialStore::new(cfg.db_path.clone(), "spotify"));
    let exchanger = Arc::new(SpotifyAuthClient::from_config(cfg).context("loading client credentials")?);
    if !exchanger.has_client_credentials() {
        tracing::warn!("no Spotify client_id/client_secret configured; token refresh will fail");
    }
    let manager = CredentialManager::load(store, exchanger, Duration::from_secs(cfg.refresh_margin_secs))
        .await
        .context("loading stored credential")?;
    let executor = Arc::new(RequestExecutor::new(
        Arc::new(manager),
        Duration::from_secs(cfg.default_retry_after_secs),
    ));
    let api = Arc::new(SpotifyPlaylistApi::new());
    Ok(Deduplicator::new(api, executor, confirmer, cfg))
}

fn print_report(report: &SyncReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "{}: {:?} - removed {}/{} planned, added {}/{} planned ({} duplicate group(s), {} re-plan(s))",
        report.collection_id,
        report.outcome,
        report.removed_count,
        report.planned_removals,
        report.added_count,
        report.planned_additions,
        report.groups,
        report.replans
    );
    if let Some(w) = &report.fetch_warning {
        println!("  warning: {}", w);
    }
    for f in &report.failures {
        println!(
            "  failed at batch {} ({}): {} [{} removal(s), {} addition(s) not applied]",
            f.batch_index, f.kind, f.message, f.unapplied_removals, f.unapplied_additions
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Explicit --config wins; otherwise prefer the system-wide file and fall
    // back to the repository example config for local use.
    let resolved_config_path: PathBuf = match &cli.config {
        Some(p) => p.clone(),
        None => {
            let etc_path = Path::new("/etc/playlist-dedup/config.toml");
            if etc_path.exists() {
                etc_path.to_path_buf()
            } else {
                PathBuf::from("config/example-config.toml")
            }
        }
    };

    if let Commands::ConfigValidate = cli.command {
        match Config::from_path(&resolved_config_path) {
            Ok(_) => println!("OK"),
            Err(e) => {
                eprintln!("Config validation failed: {}", e);
                std::process::exit(2);
            }
        }
        return Ok(());
    }

    let cfg = Config::from_path(&resolved_config_path)
        .with_context(|| format!("loading config from {}", resolved_config_path.display()))?;

    // Logs go to stdout and to a daily-rotated file in cfg.log_dir.
    let _ = LogTracer::init();
    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(&cfg.log_dir, "playlist-dedup.log");
    let (non_blocking, log_guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking))
        .with(fmt::layer().with_writer(std::io::stdout));
    tracing_subscriber_global::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")?;

    let code = match cli.command {
        Commands::Dedupe { playlists, policy, yes, json } => {
            let confirmer: Arc<dyn Confirmer> = if yes { Arc::new(AutoConfirm(true)) } else { Arc::new(StdinConfirmer) };
            let dedup = build_deduplicator(&cfg, confirmer).await?;
            let ids = if playlists.is_empty() {
                vec![resolve_playlist(&cfg, None)?]
            } else {
                playlists
            };
            let mut code = 0;
            if ids.len() == 1 {
                let report = dedup
                    .deduplicate(&ids[0], policy)
                    .await
                    .with_context(|| format!("deduplicating {}", ids[0]))?;
                code = report.exit_code();
                print_report(&report, json)?;
            } else {
                for (id, res) in dedup.deduplicate_many(&ids, policy).await {
                    match res {
                        Ok(report) => {
                            code = code.max(report.exit_code());
                            print_report(&report, json)?;
                        }
                        Err(e) => {
                            code = 1;
                            eprintln!("{}: {}", id, e);
                        }
                    }
                }
            }
            code
        }
        Commands::List { playlist } => {
            let id = resolve_playlist(&cfg, playlist)?;
            let dedup = build_deduplicator(&cfg, Arc::new(AutoConfirm(false))).await?;
            let snapshot = dedup.fetch_all(&id).await.with_context(|| format!("fetching {}", id))?;
            for it in &snapshot.items {
                if it.available {
                    println!("{:>5}  {} - {}  ({})", it.position, it.name, it.artists.join(", "), it.uri);
                } else {
                    println!("{:>5}  <unavailable>", it.position);
                }
            }
            if let Some(w) = &snapshot.warning {
                println!("warning: {}", w);
            }
            let groups = detect_groups(&snapshot);
            println!(
                "{} track(s){}, {} duplicate group(s), {} redundant occurrence(s)",
                snapshot.len(),
                if snapshot.is_complete() { "" } else { " (read incomplete)" },
                groups.len(),
                redundant_count(&groups)
            );
            0
        }
        Commands::Remove { playlist, positions, yes } => {
            let id = resolve_playlist(&cfg, playlist)?;
            let confirmer: Arc<dyn Confirmer> = if yes { Arc::new(AutoConfirm(true)) } else { Arc::new(StdinConfirmer) };
            let dedup = build_deduplicator(&cfg, confirmer).await?;
            let report = dedup.remove_positions(&id, &positions).await?;
            print_report(&report, false)?;
            report.exit_code()
        }
        Commands::Add { playlist, uris } => {
            let id = resolve_playlist(&cfg, playlist)?;
            let dedup = build_deduplicator(&cfg, Arc::new(AutoConfirm(true))).await?;
            let report = dedup.append_items(&id, uris).await?;
            print_report(&report, false)?;
            report.exit_code()
        }
        Commands::ImportTokens { file } => {
            let store = SqliteCredentialStore::new(cfg.db_path.clone(), "spotify");
            let cred = credentials::import_tokens_file(&file, &store)
                .await
                .with_context(|| format!("importing {}", file.display()))?;
            tracing::info!(expires_at_ms = cred.expires_at_ms, "tokens imported");
            println!("Saved tokens to {}", cfg.db_path.display());
            0
        }
        Commands::ConfigValidate => 0,
    };
    // flush the file log before a non-zero exit skips destructors
    drop(log_guard);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
