//! Vibe CLI - patch orchestration core
//!
//! Usage:
//!   vibe init [path]                  Write the default .vibe/config.toml
//!   vibe serve [--port N]             Run the hub and HTTP/WebSocket server
//!   vibe apply <batch.json>           Apply a patch batch to local JSON files
//!   vibe status <batch-id>            Show a batch's status from the event log
//!   vibe rollback <rollback-id>       Reverse what a batch still has applied

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vibe_core::{PatchBatch, PatchOperation, VibeConfig};
use vibe_hub::{spawn_heartbeat, AppState, BroadcastHub};
use vibe_patch::{
    AppendFileEventSink, ApplyOptions, EventPublisher, JsonFileStore, PatchEngine,
    RollbackRequest,
};

#[derive(Parser)]
#[command(name = "vibe")]
#[command(author, version, about = "Transactional patch engine and live event hub")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository root holding .vibe/
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Init {
        /// Repository path (defaults to --root)
        path: Option<PathBuf>,
    },

    /// Run the broadcast hub and HTTP/WebSocket server
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Apply a patch batch from a JSON file
    Apply {
        /// Batch file: a batch object or a bare array of operations
        file: PathBuf,

        /// Check every operation against current state without writing
        #[arg(long)]
        dry_run: bool,

        /// Only shape-check operations
        #[arg(long)]
        validate_only: bool,

        /// Keep applied operations when a later one fails
        #[arg(long)]
        no_rollback: bool,
    },

    /// Show batch status
    Status {
        /// Batch id
        batch_id: String,
    },

    /// Roll back a batch
    Rollback {
        /// Rollback id (rollback:<batch-id>)
        rollback_id: String,

        /// Reason recorded on the rollback event
        #[arg(long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if cli.verbose {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    match cli.command {
        Commands::Init { path } => cmd_init(path.unwrap_or(cli.root)).await,
        Commands::Serve { port } => cmd_serve(&cli.root, port).await,
        Commands::Apply {
            file,
            dry_run,
            validate_only,
            no_rollback,
        } => cmd_apply(&cli.root, &file, dry_run, validate_only, no_rollback).await,
        Commands::Status { batch_id } => cmd_status(&cli.root, &batch_id).await,
        Commands::Rollback {
            rollback_id,
            reason,
        } => cmd_rollback(&cli.root, rollback_id, reason).await,
    }
}

fn load_config(root: &Path) -> Result<VibeConfig> {
    VibeConfig::load_or_default(root)
        .with_context(|| format!("Failed to load config from {}", root.display()))
}

/// Engine over JSON files and the JSONL event log
fn open_engine(root: &Path, config: &VibeConfig) -> PatchEngine {
    let documents = config.resolve(root, &config.patch.documents_root);
    let event_log = config.resolve(root, &config.patch.event_log);

    PatchEngine::new(
        Arc::new(JsonFileStore::new(documents)),
        Arc::new(AppendFileEventSink::new(event_log)),
    )
}

/// Accept either a batch object or a bare array of operations
fn parse_batch(content: &str) -> Result<PatchBatch> {
    if let Ok(batch) = serde_json::from_str::<PatchBatch>(content) {
        return Ok(batch);
    }

    let patches: Vec<PatchOperation> =
        serde_json::from_str(content).context("Batch file is neither a batch nor an operation list")?;
    Ok(PatchBatch::anonymous().with_patches(patches))
}

async fn cmd_init(path: PathBuf) -> Result<()> {
    info!("Initializing Vibe in {:?}", path);

    let config_path = VibeConfig::write_default(&path).context("Failed to write config")?;

    println!("Initialized Vibe in {:?}", path);
    println!("Created:");
    println!("  {}", config_path.display());
    Ok(())
}

async fn cmd_serve(root: &Path, port: Option<u16>) -> Result<()> {
    let mut config = load_config(root)?;
    if let Some(port) = port {
        config.server.port = port;
    }

    let hub = Arc::new(BroadcastHub::from_settings(&config.hub));
    let publisher: Arc<dyn EventPublisher> = hub.clone();
    let engine = open_engine(root, &config).with_publisher(publisher);

    let heartbeat = spawn_heartbeat(hub.clone(), config.hub.heartbeat_interval());

    let state = Arc::new(AppState {
        hub,
        engine,
        outbound_buffer: config.hub.outbound_buffer,
    });

    let addr = config.listen_addr();
    println!("Vibe hub on http://{} (WebSocket at /ws)", addr);

    let result = vibe_hub::server::serve(state, &addr).await;
    heartbeat.abort();
    result
}

async fn cmd_apply(
    root: &Path,
    file: &Path,
    dry_run: bool,
    validate_only: bool,
    no_rollback: bool,
) -> Result<()> {
    let config = load_config(root)?;

    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let batch = parse_batch(&content)?;

    let options = ApplyOptions {
        dry_run,
        validate_only,
        rollback_on_failure: config.patch.rollback_on_failure && !no_rollback,
    };

    let engine = open_engine(root, &config);
    let result = engine.apply_patches(&batch, options).await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        bail!(
            "Batch {} failed: {} of {} operations failed",
            result.patch_id,
            result.failed_count,
            batch.len()
        );
    }
    Ok(())
}

async fn cmd_status(root: &Path, batch_id: &str) -> Result<()> {
    let config = load_config(root)?;
    let engine = open_engine(root, &config);

    match engine.get_patch_status(batch_id).await? {
        Some(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        None => bail!("No events recorded for batch {}", batch_id),
    }
}

async fn cmd_rollback(root: &Path, rollback_id: String, reason: Option<String>) -> Result<()> {
    let config = load_config(root)?;
    let engine = open_engine(root, &config);

    let mut request = RollbackRequest::new(rollback_id);
    if let Some(reason) = reason {
        request = request.with_reason(reason);
    }

    let outcome = engine.rollback_patch(request).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.success {
        bail!("Rollback {} did not complete", outcome.rollback_id);
    }
    Ok(())
}
