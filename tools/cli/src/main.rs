//! edgesync CLI - run and inspect an edge sync engine.
//!
//! This tool runs the sync engine from a configuration file and gives
//! read/write access to its durable queue and version map.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use edgesync_common::Priority;
use edgesync_storage::{LocalSnapshotStore, SnapshotStore};
use edgesync_sync::{
    ConnectivityMonitor, HttpHandler, HttpProbe, OperationKind, OperationQueue, QueuedOperation,
    SyncConfig, SyncEngine, VersionTracker,
};

const BUILTIN_KINDS: [OperationKind; 5] = [
    OperationKind::InferenceResultPush,
    OperationKind::ModelPush,
    OperationKind::ModelPull,
    OperationKind::ConfigPull,
    OperationKind::TelemetryUpload,
];

#[derive(Parser)]
#[command(name = "edgesync")]
#[command(about = "edgesync - Offline-tolerant edge/cloud synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (JSON). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until interrupted, delivering operations over HTTP.
    Run {
        /// Base URL receiving operations at `<base>/operations/<kind>`.
        #[arg(long)]
        handler_url: String,

        /// Additional custom operation kinds to deliver.
        #[arg(short, long = "kind")]
        kinds: Vec<String>,
    },

    /// Drain the queue once and exit.
    Drain {
        /// Base URL receiving operations at `<base>/operations/<kind>`.
        #[arg(long)]
        handler_url: String,

        /// Additional custom operation kinds to deliver.
        #[arg(short, long = "kind")]
        kinds: Vec<String>,
    },

    /// Probe the configured endpoints once.
    Probe,

    /// Add an operation to the durable queue.
    Enqueue {
        /// Operation kind (e.g. "telemetry-upload").
        #[arg(short, long)]
        kind: String,

        /// Priority: low, normal, high or critical.
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// JSON payload.
        #[arg(long, default_value = "null")]
        payload: String,
    },

    /// Show queued operations.
    Queue {
        /// Maximum number of operations to show.
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show tracked record versions.
    Versions {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Write a configuration file with default values.
    InitConfig {
        /// Output path.
        #[arg(short, long, default_value = "edgesync.json")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { handler_url, kinds } => cmd_run(config, &handler_url, &kinds).await,
        Commands::Drain { handler_url, kinds } => cmd_drain(config, &handler_url, &kinds).await,
        Commands::Probe => cmd_probe(&config).await,
        Commands::Enqueue {
            kind,
            priority,
            payload,
        } => cmd_enqueue(&config, &kind, &priority, &payload).await,
        Commands::Queue { limit, json } => cmd_queue(&config, limit, json).await,
        Commands::Versions { json } => cmd_versions(&config, json).await,
        Commands::InitConfig { output, force } => cmd_init_config(&output, force),
    }
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(SyncConfig::default()),
    }
}

fn open_store(config: &SyncConfig) -> Result<Arc<dyn SnapshotStore>> {
    let store = LocalSnapshotStore::new(&config.state_dir).with_context(|| {
        format!("Failed to open state dir {}", config.state_dir.display())
    })?;
    Ok(Arc::new(store))
}

/// Open an engine with an HTTP handler registered for every kind.
async fn open_engine(config: SyncConfig, handler_url: &str, kinds: &[String]) -> Result<SyncEngine> {
    let handler_timeout = config.handler_timeout();
    let engine = SyncEngine::open(config)
        .await
        .context("Failed to open sync engine")?;

    let custom = kinds
        .iter()
        .map(|k| k.parse::<OperationKind>())
        .collect::<edgesync_common::Result<Vec<_>>>()
        .context("Invalid operation kind")?;

    for kind in BUILTIN_KINDS.into_iter().chain(custom) {
        let handler = HttpHandler::new(handler_url, handler_timeout)
            .context("Failed to create HTTP handler")?;
        engine
            .register_handler(kind, handler)
            .await
            .context("Failed to register handler")?;
    }
    Ok(engine)
}

/// Run engine until Ctrl-C.
async fn cmd_run(config: SyncConfig, handler_url: &str, kinds: &[String]) -> Result<()> {
    let engine = open_engine(config, handler_url, kinds).await?;
    engine.start().await.context("Failed to start engine")?;

    println!("Sync engine running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    let stopped = engine.stop().await;
    print_status(&engine).await?;
    stopped.context("Final flush failed")?;
    Ok(())
}

/// Drain the queue until it is empty or connectivity drops.
async fn cmd_drain(config: SyncConfig, handler_url: &str, kinds: &[String]) -> Result<()> {
    let engine = open_engine(config, handler_url, kinds).await?;

    let status = engine.check_connectivity().await;
    if !engine.is_online() {
        warn!("Not draining: connectivity is {}", status);
    }

    while engine.is_online() {
        let report = engine.sync_once().await;
        if report.is_empty() {
            break;
        }
        let only_skips = report.skipped == report.attempted;
        println!(
            "Batch: {} attempted, {} completed, {} retried, {} dropped, {} skipped",
            report.attempted, report.completed, report.retried, report.dropped, report.skipped
        );
        if only_skips {
            warn!("Remaining operations await manual conflict resolution");
            break;
        }
        engine.check_connectivity().await;
    }

    let stopped = engine.stop().await;
    print_status(&engine).await?;
    for dropped in engine.dropped_operations().await {
        println!(
            "Dropped {} ({}): {}",
            dropped.operation.id, dropped.operation.kind, dropped.reason
        );
    }
    stopped.context("Final flush failed")?;
    Ok(())
}

async fn print_status(engine: &SyncEngine) -> Result<()> {
    let status = engine.get_status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Probe endpoints once.
async fn cmd_probe(config: &SyncConfig) -> Result<()> {
    if config.endpoints.is_empty() {
        anyhow::bail!("No endpoints configured");
    }

    let probe = Arc::new(HttpProbe::new().context("Failed to create HTTP probe")?);
    let monitor = ConnectivityMonitor::new(
        config.endpoints.clone(),
        probe,
        config.probe_timeout(),
        1,
    );
    let status = monitor.check_connectivity().await;

    println!("Connectivity: {}", status);
    if let Some(sample) = monitor.history().await.last() {
        println!("  Reachable: {}/{}", sample.reachable, sample.total);
    }
    Ok(())
}

/// Add an operation to the durable queue.
async fn cmd_enqueue(config: &SyncConfig, kind: &str, priority: &str, payload: &str) -> Result<()> {
    let kind: OperationKind = kind.parse().context("Invalid operation kind")?;
    let priority = Priority::parse(priority).context("Invalid priority")?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let queue = OperationQueue::open(
        open_store(config)?,
        config.queue_file.clone(),
        config.queue_capacity,
    )
    .await
    .context("Failed to open queue")?;

    let op = QueuedOperation::new(kind, payload, priority, config.max_retries);
    let id = op.id.clone();
    queue.enqueue(op).await.context("Failed to enqueue operation")?;
    if queue.durability_degraded() {
        anyhow::bail!("Operation {} was not persisted", id);
    }

    println!("Enqueued {}", id);
    Ok(())
}

/// Show queued operations.
async fn cmd_queue(config: &SyncConfig, limit: usize, json: bool) -> Result<()> {
    let queue = OperationQueue::open(
        open_store(config)?,
        config.queue_file.clone(),
        config.queue_capacity,
    )
    .await
    .context("Failed to open queue")?;

    let ops = queue.peek(limit).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&ops)?);
        return Ok(());
    }

    println!("{} queued (capacity {})", queue.len().await, queue.capacity());
    for op in ops {
        let due = op
            .not_before
            .map(|t| format!(", due {}", t.to_rfc3339()))
            .unwrap_or_default();
        println!(
            "  {} {:<9} {} retries {}/{}{}",
            op.id,
            op.priority.to_string(),
            op.kind,
            op.retry_count, op.max_retries, due
        );
    }
    Ok(())
}

/// Show tracked versions.
async fn cmd_versions(config: &SyncConfig, json: bool) -> Result<()> {
    let tracker = VersionTracker::open(open_store(config)?, config.versions_file.clone())
        .await
        .context("Failed to open version map")?;

    let records = tracker.records().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No tracked records");
        return Ok(());
    }
    for record in records {
        println!(
            "  {} [{}] v{} from {} ({} bytes, {})",
            record.record_id,
            record.data_kind,
            record.version,
            record.origin,
            record.size_bytes,
            &record.content_hash[..12.min(record.content_hash.len())]
        );
    }
    Ok(())
}

/// Write default configuration.
fn cmd_init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let json = SyncConfig::default().to_json()?;
    std::fs::write(output, json)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Wrote default configuration to {}", output.display());
    Ok(())
}
