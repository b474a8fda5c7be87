//! Fieldsync CLI - Command line interface for the local sync queue.
//!
//! This tool records local writes into a SQLite store, runs sync cycles
//! against an HTTP backend, and inspects or repairs the mutation queue.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

use fieldsync_common::{Action, EntityType, Error, Record, Resolution};
use fieldsync_storage::{LocalStore, SqliteStore};
use fieldsync_sync::{
    Adapter, HttpAdapter, PullResponse, PushResponse, ResolutionResult, SyncConfig, SyncEngine,
};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Fieldsync - Offline-first record sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local database (default: platform data directory).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Backend base URL, overriding the configuration file.
    #[arg(long)]
    server: Option<String>,

    /// Bearer token, overriding the configuration file.
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a local write and queue it for sync.
    Write {
        /// Entity type: zona, cultivo, riego, cosecha or gasto.
        entity: EntityType,

        /// Entity id.
        id: String,

        /// create, update or delete.
        action: Action,

        /// Fields as a JSON object.
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Run one sync cycle.
    Sync,

    /// Show queue and checkpoint state.
    Status,

    /// List unresolved conflicts.
    Conflicts,

    /// Resolve a conflict.
    Resolve {
        /// Queue item id.
        id: String,

        /// Which side wins: local or server.
        decision: Resolution,
    },

    /// Give a failed item a fresh retry budget.
    Retry {
        /// Queue item id.
        id: String,
    },

    /// Drop a queued write without sending it.
    Discard {
        /// Queue item id.
        id: String,
    },

    /// Delete failed items older than the retention period.
    Cleanup,

    /// Print shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

/// Contents of the configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    server_url: Option<String>,
    auth_token: Option<String>,
    database: Option<PathBuf>,
    sync: SyncConfig,
}

impl FileConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))
    }
}

/// Stand-in adapter for commands that never reach the network.
struct Offline;

#[async_trait]
impl Adapter for Offline {
    fn name(&self) -> &str {
        "offline"
    }

    async fn push(
        &self,
        _entity_type: EntityType,
        _entity_id: &str,
        _action: Action,
        _payload: &Record,
    ) -> fieldsync_common::Result<PushResponse> {
        Err(Error::Network("no server configured".to_string()))
    }

    async fn pull(
        &self,
        _entity_type: EntityType,
        _since: Option<DateTime<Utc>>,
    ) -> fieldsync_common::Result<PullResponse> {
        Err(Error::Network("no server configured".to_string()))
    }

    async fn is_available(&self) -> bool {
        false
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "fieldsync", &mut std::io::stdout());
        return Ok(());
    }

    let file = FileConfig::load(cli.config.as_deref())?;
    let needs_server = matches!(cli.command, Commands::Sync);
    let engine = open_engine(&cli, file, needs_server)?;

    match cli.command {
        Commands::Write {
            entity,
            id,
            action,
            data,
        } => cmd_write(&engine, entity, &id, action, data.as_deref()).await,

        Commands::Sync => cmd_sync(&engine).await,

        Commands::Status => cmd_status(&engine).await,

        Commands::Conflicts => cmd_conflicts(&engine).await,

        Commands::Resolve { id, decision } => cmd_resolve(&engine, &id, decision).await,

        Commands::Retry { id } => cmd_retry(&engine, &id).await,

        Commands::Discard { id } => cmd_discard(&engine, &id).await,

        Commands::Cleanup => cmd_cleanup(&engine).await,

        Commands::Completions { .. } => Ok(()),
    }
}

/// Default database location inside the platform data directory.
fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
        .join("fieldsync.db")
}

/// Open the local store and build an engine around it.
fn open_engine(cli: &Cli, file: FileConfig, needs_server: bool) -> Result<SyncEngine> {
    let db_path = cli
        .db
        .clone()
        .or(file.database)
        .unwrap_or_else(default_db_path);
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    info!("Using database {}", db_path.display());

    let store: Arc<dyn LocalStore> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?,
    );

    let server = cli.server.clone().or(file.server_url);
    let adapter: Arc<dyn Adapter> = match server {
        Some(server) => {
            let base = Url::parse(&server).context("Invalid server URL")?;
            let mut adapter = HttpAdapter::new(base).context("Failed to create HTTP adapter")?;
            if let Some(token) = cli.token.clone().or(file.auth_token) {
                adapter = adapter.with_token(token);
            }
            Arc::new(adapter)
        }
        None if needs_server => {
            anyhow::bail!("No server configured. Use --server or set server_url in the config file");
        }
        None => Arc::new(Offline),
    };

    SyncEngine::new(adapter, store, file.sync).context("Invalid sync configuration")
}

/// Record a local write.
async fn cmd_write(
    engine: &SyncEngine,
    entity: EntityType,
    id: &str,
    action: Action,
    data: Option<&str>,
) -> Result<()> {
    let payload: Record = match data {
        Some(raw) => serde_json::from_str(raw).context("--data must be a JSON object")?,
        None => Record::new(),
    };

    let item = engine
        .write_local(entity, id, action, payload)
        .await
        .context("Failed to record write")?;

    println!("Queued {} {}/{}", item.action, entity, id);
    println!("  Item: {}", item.id);
    println!("  State: {}", item.state);

    Ok(())
}

/// Run one sync cycle.
async fn cmd_sync(engine: &SyncEngine) -> Result<()> {
    let summary = engine.run_cycle().await;

    if summary.is_empty() {
        println!("Nothing to sync.");
    } else {
        println!("Sync finished:");
        println!("  Pushed: {}", summary.pushed);
        println!("  Pulled: {}", summary.pulled);
        println!("  Conflicts: {}", summary.conflicts);
        println!("  Errors: {}", summary.errors);
    }

    Ok(())
}

/// Show engine status.
async fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let status = engine.status().await.context("Failed to read status")?;

    println!("Pending: {}", status.pending);
    println!("Conflicts: {}", status.conflicts);
    println!("Failed: {}", status.failed);
    match status.checkpoint {
        Some(at) => println!("Last full pull: {}", at.to_rfc3339()),
        None => println!("Last full pull: never"),
    }

    let failed = engine.queue().failed().await?;
    if !failed.is_empty() {
        println!("\nFailed items:");
        for item in failed {
            println!(
                "  {} {} {}/{} ({})",
                item.id,
                item.action,
                item.entity_type,
                item.entity_id,
                item.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

/// List unresolved conflicts.
async fn cmd_conflicts(engine: &SyncEngine) -> Result<()> {
    let conflicts = engine
        .conflicts()
        .list()
        .await
        .context("Failed to list conflicts")?;

    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }

    for item in conflicts {
        println!("{} {}/{} ({})", item.id, item.entity_type, item.entity_id, item.action);
        println!("  Local:  {}", serde_json::to_string(&item.payload)?);
        let server = item.server_payload.unwrap_or_default();
        println!("  Server: {}", serde_json::to_string(&server)?);
    }

    Ok(())
}

/// Resolve a conflict.
async fn cmd_resolve(engine: &SyncEngine, id: &str, decision: Resolution) -> Result<()> {
    let result = engine
        .resolve_conflict(id, decision)
        .await
        .context("Failed to resolve conflict")?;

    match result {
        ResolutionResult::Requeued(item) => {
            println!("Kept local data; {} will be pushed on the next sync.", item.id);
        }
        ResolutionResult::AdoptedServer {
            entity_type,
            entity_id,
            ..
        } => {
            println!("Adopted server data for {}/{}.", entity_type, entity_id);
        }
    }

    Ok(())
}

/// Retry a failed item.
async fn cmd_retry(engine: &SyncEngine, id: &str) -> Result<()> {
    let item = engine
        .queue()
        .retry(id)
        .await
        .context("Failed to retry item")?;
    println!("{} is pending again.", item.id);
    Ok(())
}

/// Discard a queued write.
async fn cmd_discard(engine: &SyncEngine, id: &str) -> Result<()> {
    let item = engine
        .queue()
        .discard(id)
        .await
        .context("Failed to discard item")?;
    println!(
        "Discarded {} {}/{}. The local record is left as is.",
        item.action, item.entity_type, item.entity_id
    );
    Ok(())
}

/// Remove long-dead failed items.
async fn cmd_cleanup(engine: &SyncEngine) -> Result<()> {
    let removed = engine
        .queue()
        .cleanup_old(engine.config().cleanup_retention())
        .await
        .context("Cleanup failed")?;
    println!("Removed {} failed items.", removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_write() {
        let cli = Cli::try_parse_from([
            "fieldsync",
            "write",
            "zona",
            "z1",
            "update",
            "--data",
            r#"{"nombre": "Norte"}"#,
        ])
        .unwrap();

        match cli.command {
            Commands::Write {
                entity, action, ..
            } => {
                assert_eq!(entity, EntityType::Zona);
                assert_eq!(action, Action::Update);
            }
            _ => panic!("expected write"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_entity() {
        assert!(Cli::try_parse_from(["fieldsync", "write", "parcela", "p1", "create"]).is_err());
    }

    #[test]
    fn test_file_config_defaults() {
        let config: FileConfig =
            serde_json::from_str(r#"{"server_url": "https://api.example.com", "sync": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(config.server_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.sync.max_attempts, 2);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
