//! Blocksync CLI - Command line host for the reconciliation engine.
//!
//! This tool keeps a local blocked-user list in a JSON key-value store and
//! reconciles it with the remote list, either on demand or as a daemon.

mod config;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blocksync_common::{Credential, Identity};
use blocksync_remote::HttpRemoteList;
use blocksync_storage::{KeyValueStore, LocalStore};
use blocksync_sync::{ReconciliationEngine, SyncOutcome, SyncScheduler};

use crate::config::Config;

type Engine = ReconciliationEngine<LocalStore, HttpRemoteList>;

#[derive(Parser)]
#[command(name = "blocksync")]
#[command(about = "Blocksync - Keep a blocked-user list in sync with the remote")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: <config dir>/blocksync/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Key-value store file, overriding the configuration.
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Block a user.
    Block {
        /// Identity to block.
        identity: String,
    },

    /// Unblock a user.
    Unblock {
        /// Identity to unblock.
        identity: String,
    },

    /// List blocked users.
    List,

    /// Show sync status and pending operations.
    Status,

    /// Full sync, then retry every pending operation now.
    Sync,

    /// Retry pending operations that are due.
    Drain,

    /// Check that the remote accepts the configured API key.
    Check,

    /// Configure the API key and run the initial sync.
    SetKey {
        /// API key issued by the remote.
        key: String,
    },

    /// Remove the API key (offline mode).
    ClearKey,

    /// Unblock everyone.
    ClearAll,

    /// Run scheduled syncs until interrupted.
    Daemon,

    /// Print shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "blocksync", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store_path = Some(store);
    }
    let engine = open_engine(&config).await?;

    match cli.command {
        Commands::Block { identity } => cmd_block(&engine, &identity).await,
        Commands::Unblock { identity } => cmd_unblock(&engine, &identity).await,
        Commands::List => cmd_list(&engine).await,
        Commands::Status => cmd_status(&engine).await,
        Commands::Sync => cmd_sync(&engine).await,
        Commands::Drain => cmd_drain(&engine).await,
        Commands::Check => cmd_check(&engine).await,
        Commands::SetKey { key } => cmd_set_key(&engine, key).await,
        Commands::ClearKey => cmd_clear_key(&engine).await,
        Commands::ClearAll => cmd_clear_all(&engine).await,
        Commands::Daemon => cmd_daemon(engine).await,
        Commands::Completions { .. } => Ok(()),
    }
}

/// Open the store and remote described by the configuration.
async fn open_engine(config: &Config) -> Result<Engine> {
    let store_path = config.store_path();
    let store = LocalStore::open(&store_path)
        .await
        .with_context(|| format!("Failed to open store {}", store_path.display()))?;
    let remote = HttpRemoteList::new(&config.remote).context("Failed to create HTTP client")?;

    Ok(ReconciliationEngine::new(
        Arc::new(store),
        Arc::new(remote),
        config.sync.clone(),
    ))
}

fn parse_identity(raw: &str) -> Result<Identity> {
    Identity::new(raw).with_context(|| format!("Invalid identity '{}'", raw))
}

async fn cmd_block(engine: &Engine, raw: &str) -> Result<()> {
    let identity = parse_identity(raw)?;
    let outcome = engine.block(&identity).await?;
    println!("Blocked {}: {}", identity, outcome);
    Ok(())
}

async fn cmd_unblock(engine: &Engine, raw: &str) -> Result<()> {
    let identity = parse_identity(raw)?;
    let outcome = engine.unblock(&identity).await?;
    println!("Unblocked {}: {}", identity, outcome);
    Ok(())
}

async fn cmd_list(engine: &Engine) -> Result<()> {
    let blocked = engine.blocked().await?;
    if blocked.is_empty() {
        println!("No blocked users.");
        return Ok(());
    }
    println!("Blocked users ({}):", blocked.len());
    for identity in &blocked {
        println!("  {}", identity);
    }
    Ok(())
}

async fn cmd_status(engine: &Engine) -> Result<()> {
    let online = engine.credential().await?.is_some();
    let status = engine.status().await?;
    let operations = engine.pending_operations().await?;
    let max_attempts = engine.config().backoff.max_attempts();

    println!("Sync Status:");
    println!("  Mode: {}", if online { "online" } else { "offline (no API key)" });
    match status.last_sync_time {
        Some(at) => println!("  Last sync: {}", format_time(at)),
        None => println!("  Last sync: never"),
    }
    match status.last_sync_success {
        Some(true) => println!("  Result: success"),
        Some(false) => println!("  Result: failed"),
        None => {}
    }
    if let Some(error) = &status.last_sync_error {
        println!("  Error: {}", error);
    }
    println!("  Pending: {}", status.pending);
    println!("  Failed: {}", status.failed);
    println!(
        "  Retry schedule: {}",
        format_delays(engine.config().backoff.delays())
    );

    for op in operations {
        let state = if op.is_abandoned(max_attempts) {
            "failed, max retries exceeded".to_string()
        } else {
            match op.next_retry_time {
                Some(at) => format!("retry at {}", format_time(at)),
                None => "due".to_string(),
            }
        };
        println!(
            "  - {} {} (retries: {}, {})",
            op.op_type, op.identity, op.retry_count, state
        );
        if let Some(error) = &op.last_error {
            println!("      last error: {}", error);
        }
    }
    Ok(())
}

fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_delays(delays: &[Duration]) -> String {
    delays
        .iter()
        .map(|delay| {
            let secs = delay.as_secs();
            if secs >= 3600 && secs % 3600 == 0 {
                format!("{}h", secs / 3600)
            } else if secs >= 60 && secs % 60 == 0 {
                format!("{}m", secs / 60)
            } else {
                format!("{}s", secs)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

async fn cmd_sync(engine: &Engine) -> Result<()> {
    let report = engine.manual_sync().await;
    println!("Sync: {}", report.full_sync);
    println!("Queue: {}", report.drain);
    if let SyncOutcome::Failed { error } = report.full_sync {
        anyhow::bail!("Sync failed: {}", error);
    }
    Ok(())
}

async fn cmd_drain(engine: &Engine) -> Result<()> {
    let report = engine.drain_queue().await;
    println!("Queue: {}", report);
    Ok(())
}

async fn cmd_check(engine: &Engine) -> Result<()> {
    let check = engine.check_connection().await?;
    if check.success {
        println!("Connection OK");
        return Ok(());
    }
    let error = check.error.unwrap_or_default();
    if check.is_auth_error {
        anyhow::bail!("API key rejected: {}", error);
    }
    anyhow::bail!("Connection failed: {}", error)
}

async fn cmd_set_key(engine: &Engine, key: String) -> Result<()> {
    let credential = Credential::new(key)?;
    match engine.configure_credential(credential).await {
        SyncOutcome::Failed { error } => anyhow::bail!("Initial sync failed: {}", error),
        outcome => {
            println!("API key saved. Initial sync: {}", outcome);
            Ok(())
        }
    }
}

async fn cmd_clear_key(engine: &Engine) -> Result<()> {
    engine.clear_credential().await?;
    println!("API key removed. Running in offline mode.");
    Ok(())
}

async fn cmd_clear_all(engine: &Engine) -> Result<()> {
    let outcome = engine.clear_all().await?;
    println!("Cleared {} blocked users.", outcome.cleared);
    if let Some(report) = outcome.sync {
        println!("Sync: {}", report.full_sync);
        println!("Queue: {}", report.drain);
    }
    Ok(())
}

async fn cmd_daemon(engine: Engine) -> Result<()> {
    let engine = Arc::new(engine);
    let mode = engine.config().sync_mode();
    info!("Starting daemon ({:?})", mode);

    let (scheduler, handle) = SyncScheduler::new(mode);
    let sync_engine = engine.clone();
    let scheduler_task = tokio::spawn(handle.run(move |request| {
        let engine = sync_engine.clone();
        async move { engine.process_request(request).await }
    }));

    let mut changes = engine.store().subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => info!(
                    "Store changed: {} ({})",
                    change.key,
                    if change.new_value.is_some() { "set" } else { "removed" }
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} store change notifications", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    scheduler.shutdown().await?;
    scheduler_task.await.context("Scheduler task panicked")?;
    watcher.abort();
    Ok(())
}
