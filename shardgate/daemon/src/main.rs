//! Shardgate Daemon - Shard Pool Lifecycle Host
//!
//! Loads the shard topology, opens lazily connecting pools for every shard's
//! writer and readers, and keeps them alive until asked to stop. On shutdown
//! every pool is closed concurrently.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (one shard on localhost)
//! shardgate-daemon
//!
//! # With config file
//! shardgate-daemon --config /etc/shardgate/shards.toml
//!
//! # Check every writer and reader answers, then exit
//! SHARD_COUNT=2 SHARD_1_WRITE_HOST=pg-1 shardgate-daemon --probe
//!
//! # Verbose logging
//! RUST_LOG=debug shardgate-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Close all pools and exit

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use shardgate_core::{
    default_config_path, load_config_from_path, PgPoolFactory, ShardError, ShardManager,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Shardgate Daemon - hash-sharded PostgreSQL pools with read replicas
#[derive(Parser, Debug)]
#[command(name = "shardgate-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SHARDGATE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SHARDGATE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Run `SELECT 1` on every writer and reader, then exit
    #[arg(long)]
    probe: bool,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "shardgate_daemon={level},shardgate_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Block until SIGTERM or SIGINT
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

/// Run `SELECT 1` on every pool of every shard concurrently
async fn probe(manager: &ShardManager) -> Result<()> {
    let mut handles = Vec::new();
    for index in 0..manager.shard_count() {
        handles.extend(manager.pools_of(index)?);
    }

    let outcomes = join_all(handles.iter().map(|handle| async move {
        (handle, handle.execute("SELECT 1", &[]).await)
    }))
    .await;

    let mut failed = 0_usize;
    for (handle, outcome) in outcomes {
        match outcome {
            Ok(_) => info!(
                shard = handle.shard(),
                role = %handle.role(),
                endpoint = handle.endpoint(),
                "Probe ok"
            ),
            Err(e) => {
                failed += 1;
                error!(
                    shard = handle.shard(),
                    role = %handle.role(),
                    endpoint = handle.endpoint(),
                    error = %e,
                    "Probe failed"
                );
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} pool(s) failed the probe", handles.len());
    }
    info!(pools = handles.len(), "All pools answered");
    Ok(())
}

/// Close every pool, logging failures without aborting shutdown
async fn shutdown(manager: &ShardManager) -> Result<()> {
    match manager.close_all().await {
        Ok(()) => Ok(()),
        Err(ShardError::Close { failures }) => {
            for failure in &failures {
                warn!(%failure, "Pool did not close cleanly");
            }
            anyhow::bail!("{} pool(s) failed to close", failures.len())
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Shardgate daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.or_else(default_config_path);
    if let Some(ref path) = config_path {
        info!(config_path = ?path, "Config file");
    }

    let config = load_config_from_path(config_path).context("Failed to load shard configuration")?;
    info!(
        shards = config.shard_count(),
        source = %config.source(),
        "Configuration loaded"
    );

    let manager = Arc::new(ShardManager::new(config, Arc::new(PgPoolFactory::new())));
    manager
        .initialize()
        .context("Failed to initialize shard pools")?;

    let result = if args.probe {
        probe(&manager).await
    } else {
        wait_for_shutdown().await
    };

    info!("Shutting down...");
    let closed = shutdown(&manager).await;

    match result.and(closed) {
        Ok(()) => {
            info!("Shardgate daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
