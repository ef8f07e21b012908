//! Progressive Delivery Controller - daemon.
//!
//! Hosts the canary controller, the live traffic router, and the HTTP
//! API the application and operators consume.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use pdcd::controller::RolloutManager;
use pdcd::events::EventBus;
use pdcd::history::DeploymentHistoryStore;
use pdcd::http_api::{self, HttpState};
use pdcd::rollback::{CommandOrchestrator, RollbackExecutor};
use pdcd::router::TrafficRouter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use pdc_common::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "pdcd")]
#[command(author, version, about = "Progressive Delivery Controller daemon")]
struct Cli {
    /// Path to the daemon configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the deployment history file (overrides the config file)
    #[arg(long)]
    history_file: Option<PathBuf>,

    /// Decision-loop poll interval, e.g. "10s" (overrides the config file)
    #[arg(long, value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Starting PDC daemon...");

    let config = DaemonConfig::load_or_default(cli.config.as_deref())
        .context("failed to load daemon configuration")?;

    let history_path = cli.history_file.or_else(|| config.history.path.clone());
    let history = Arc::new(match &history_path {
        Some(path) => DeploymentHistoryStore::load_from_file(path, config.history.limit)
            .with_context(|| format!("failed to load deployment history from {}", path.display()))?,
        None => {
            warn!("no history file configured; deployment history is in-memory only");
            DeploymentHistoryStore::new(config.history.limit)
        }
    });
    info!(
        entries = history.len(),
        current = history
            .current()
            .map(|v| v.version.to_string())
            .unwrap_or_else(|| "none".to_string()),
        "deployment history ready"
    );

    let router = Arc::new(TrafficRouter::new(
        config.router.strategy,
        config.router.default_target.clone(),
    ));
    let orchestrator = Arc::new(CommandOrchestrator::new(config.rollback.orchestrator.clone()));
    let executor = Arc::new(RollbackExecutor::new(
        config.rollback.clone(),
        orchestrator,
        history.clone(),
    ));
    let events = EventBus::default();

    // Log every rollout lifecycle event for operators tailing the daemon.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => info!(target: "pdcd::events", "{line}"),
                Err(e) => warn!("failed to serialize rollout event: {e}"),
            }
        }
    });

    let poll_interval = cli
        .poll_interval
        .unwrap_or_else(|| config.controller.poll_interval());
    let manager = Arc::new(RolloutManager::new(
        router.clone(),
        history.clone(),
        executor,
        events,
        poll_interval,
    ));

    let port = cli.port.unwrap_or(config.server.port);
    let state = HttpState {
        manager,
        router,
        history,
        version: env!("CARGO_PKG_VERSION"),
        started_at: Instant::now(),
        pid: std::process::id(),
    };
    let server = http_api::start_server(port, state).await;
    info!(port, poll_interval = ?poll_interval, "PDC daemon ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping daemon");
    server.abort();

    Ok(())
}
