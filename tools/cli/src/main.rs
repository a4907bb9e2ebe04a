//! Offsync CLI - Command line interface for the offline sync queue.
//!
//! This tool queues document operations in a local data directory and
//! replays them against the local stores when connectivity allows.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use offsync_common::OperationId;
use offsync_storage::{LocalDocumentStore, LocalKeyValueStore, LocalMetadataStore};
use offsync_sync::{
    ConflictStrategy, ConnectivityMonitor, DrainOutcome, DrainReport, OperationType, SyncConfig,
    SyncEngine,
};

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "Offsync - Offline operation queue and sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Data directory (default: platform data dir + /offsync).
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Behave as if the network were unavailable.
    #[arg(long, global = true)]
    offline: bool,

    /// JSON engine configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue an operation.
    Enqueue {
        /// Operation type: create, update, delete, move, or copy.
        #[arg(short = 't', long = "type")]
        op_type: String,

        /// Target document id.
        #[arg(short = 'i', long)]
        target: String,

        /// JSON payload, e.g. '{"content": "..."}'.
        #[arg(short, long)]
        payload: Option<String>,

        /// Attempt ceiling for this operation.
        #[arg(short, long)]
        max_attempts: Option<u32>,
    },

    /// Show the sync status.
    Status,

    /// Drain the queue now.
    Sync,

    /// List queued operations.
    Queue,

    /// Remove terminally failed operations.
    ClearFailed,

    /// List conflicts awaiting a decision.
    Conflicts,

    /// Resolve a held conflict.
    Resolve {
        /// Operation id holding the conflict.
        #[arg(short = 'o', long)]
        operation: String,

        /// Strategy: keep_local, keep_remote, or merge.
        #[arg(short, long)]
        strategy: String,
    },

    /// Export queue, last sync time and store contents as JSON.
    Export {
        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
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

    let data_dir = resolve_data_dir(cli.data_dir)?;
    let config = load_config(cli.config.as_deref())?;
    let engine = open_engine(&data_dir, !cli.offline, config).await?;

    let result = match cli.command {
        Commands::Enqueue {
            op_type,
            target,
            payload,
            max_attempts,
        } => cmd_enqueue(&engine, &op_type, &target, payload.as_deref(), max_attempts).await,

        Commands::Status => cmd_status(&engine),

        Commands::Sync => cmd_sync(&engine).await,

        Commands::Queue => cmd_queue(&engine).await,

        Commands::ClearFailed => cmd_clear_failed(&engine).await,

        Commands::Conflicts => cmd_conflicts(&engine).await,

        Commands::Resolve {
            operation,
            strategy,
        } => cmd_resolve(&engine, &operation, &strategy).await,

        Commands::Export { output } => cmd_export(&engine, output.as_deref()).await,
    };

    engine.close().await;
    result
}

fn resolve_data_dir(data_dir: Option<PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(dir) => Ok(dir),
        None => dirs::data_dir()
            .map(|dir| dir.join("offsync"))
            .context("Could not determine a data directory; pass --data-dir"),
    }
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    SyncConfig::from_json(&json).context("Invalid config")
}

/// Open the engine over the stores kept under `data_dir`.
async fn open_engine(data_dir: &Path, online: bool, config: SyncConfig) -> Result<SyncEngine> {
    info!("Using data directory: {}", data_dir.display());

    let documents = LocalDocumentStore::new(data_dir.join("documents"))
        .context("Failed to open document store")?;
    let metadata = LocalMetadataStore::new(data_dir.join("metadata"))
        .context("Failed to open metadata store")?;
    let state = LocalKeyValueStore::new(data_dir.join("state"))
        .context("Failed to open state store")?;

    SyncEngine::new(
        Arc::new(documents),
        Arc::new(metadata),
        Arc::new(state),
        Arc::new(ConnectivityMonitor::new(online)),
        config,
    )
    .await
    .context("Failed to start sync engine")
}

/// Parse a snake_case enum name the way it is serialized.
fn parse_name<T: DeserializeOwned>(name: &str, what: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(name.to_lowercase()))
        .with_context(|| format!("Unknown {}: {}", what, name))
}

/// Run passes until one completes, waiting out any pass already running.
async fn drain(engine: &SyncEngine) -> Result<Option<DrainReport>> {
    let mut status = engine.status_watch();
    loop {
        status
            .wait_for(|s| !s.draining)
            .await
            .map(|_| ())
            .context("Sync engine stopped")?;

        match engine.force_sync().await.context("Sync failed")? {
            DrainOutcome::Finished(report) => return Ok(Some(report)),
            DrainOutcome::AlreadyRunning => continue,
            DrainOutcome::Skipped => return Ok(None),
        }
    }
}

fn print_report(report: &DrainReport) {
    println!("Sync pass ({}) finished in {:?}", report.trigger, report.duration);
    println!("  Completed: {}", report.completed);
    println!("  Failed:    {}", report.failed);
    println!("  Retrying:  {}", report.retried);
    println!("  Conflicts: {}", report.conflicts);
    if report.interrupted {
        println!("  (interrupted)");
    }
}

/// Queue an operation and, when online, drain right away.
async fn cmd_enqueue(
    engine: &SyncEngine,
    op_type: &str,
    target: &str,
    payload: Option<&str>,
    max_attempts: Option<u32>,
) -> Result<()> {
    let op_type: OperationType = parse_name(op_type, "operation type")?;
    let payload = match payload {
        Some(raw) => serde_json::from_str(raw).context("Payload is not valid JSON")?,
        None => serde_json::Value::Null,
    };

    let op = engine
        .queue_operation(op_type, target, payload, max_attempts)
        .await;
    println!("Queued {} {} for {}", op.op_type, op.id, op.target_id);

    if engine.get_status().online {
        if let Some(report) = drain(engine).await? {
            print_report(&report);
        }
    } else {
        println!("Offline: the operation will run on the next sync.");
    }
    Ok(())
}

fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let status = engine.get_status();

    println!("Sync status:");
    println!("  Online:     {}", status.online);
    match status.last_sync_at {
        Some(at) => println!("  Last sync:  {}", at.to_rfc3339()),
        None => println!("  Last sync:  never"),
    }
    println!("  Pending:    {}", status.pending_count);
    println!("  Failed:     {}", status.failed_count);
    println!("  Conflicts:  {}", status.conflict_count);

    Ok(())
}

async fn cmd_sync(engine: &SyncEngine) -> Result<()> {
    if let Some(report) = drain(engine).await? {
        print_report(&report);
    }

    let status = engine.get_status();
    if status.pending_count > 0 {
        println!("{} operation(s) still pending", status.pending_count);
    }
    Ok(())
}

async fn cmd_queue(engine: &SyncEngine) -> Result<()> {
    let operations = engine.snapshot().await;
    if operations.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for op in operations {
        let status = serde_json::to_value(op.status)?;
        println!(
            "{}  {:<7} {:<20} {:<12} attempt {}/{}",
            op.id,
            op.op_type,
            op.target_id,
            status.as_str().unwrap_or("?"),
            op.attempt,
            op.max_attempts
        );
        if let Some(at) = op.next_attempt_at {
            println!("    next attempt at {}", at.to_rfc3339());
        }
        if let Some(error) = op.last_error {
            println!("    error: {}", error);
        }
    }
    Ok(())
}

async fn cmd_clear_failed(engine: &SyncEngine) -> Result<()> {
    let removed = engine
        .clear_failed_operations()
        .await
        .context("Failed to clear failed operations")?;
    println!("Removed {} failed operation(s).", removed);
    Ok(())
}

async fn cmd_conflicts(engine: &SyncEngine) -> Result<()> {
    let conflicts = engine.pending_conflicts().await;
    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }

    for conflict in conflicts {
        let remote = conflict
            .resolution
            .remote_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {}  local v{} / remote v{}  detected {}",
            conflict.operation_id,
            conflict.resolution.target_id,
            conflict.resolution.local_version,
            remote,
            conflict.resolution.decided_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn cmd_resolve(engine: &SyncEngine, operation: &str, strategy: &str) -> Result<()> {
    let strategy: ConflictStrategy = parse_name(strategy, "strategy")?;
    let id = OperationId::new(operation).context("Invalid operation id")?;

    engine
        .resolve_conflict(&id, strategy)
        .await
        .context("Failed to resolve conflict")?;
    println!("Conflict on {} resolved as {}.", id, strategy);

    if engine.get_status().online {
        if let Some(report) = drain(engine).await? {
            print_report(&report);
        }
    }
    Ok(())
}

async fn cmd_export(engine: &SyncEngine, output: Option<&Path>) -> Result<()> {
    let export = engine.export_state().await.context("Failed to export state")?;
    let json = serde_json::to_string_pretty(&export)?;

    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Exported state to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
