//! gridleased — the gridlease daemon.
//!
//! Single binary that assembles the orchestration engine:
//! - Record store (redb)
//! - Simulated grid built from the configured node inventory
//! - Request poller, batch deployer, VM and cluster reapers
//! - Deployment counters
//!
//! # Usage
//!
//! ```text
//! gridleased run --config /etc/gridlease/gridlease.toml
//! gridleased check-config --config /etc/gridlease/gridlease.toml
//! ```

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use gridlease_grid::MemoryGrid;
use gridlease_metrics::{DeploymentCounter, render_prometheus};
use gridlease_scheduler::Orchestrator;
use gridlease_state::StateStore;

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "gridleased", about = "gridlease deployment daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the admission, batch deployment, and reaper loops until Ctrl-C.
    Run {
        /// Path to gridlease.toml.
        #[arg(long, default_value = "gridlease.toml")]
        config: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long, default_value = "gridlease.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,gridleased=debug,gridlease=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, json } => {
            init_tracing(json);
            run(&config).await
        }
        Command::CheckConfig { config } => {
            let parsed = DaemonConfig::from_file(&config)?;
            println!(
                "{}: ok ({} nodes, {} seed users, {} seed requests)",
                config.display(),
                parsed.grid.nodes.len(),
                parsed.seed.users.len(),
                parsed.seed.requests.len()
            );
            Ok(())
        }
    }
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = DaemonConfig::from_file(config_path)?;
    info!(path = ?config_path, "gridlease daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    std::fs::create_dir_all(&config.state.data_dir)?;
    let db_path = config.state.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    config.apply_seed(&store)?;

    let grid = Arc::new(MemoryGrid::new(config.nodes()));
    info!(nodes = config.grid.nodes.len(), farm_id = config.scheduler.farm_id, "simulated grid ready");

    let metrics = Arc::new(DeploymentCounter::new());
    let orchestrator = Orchestrator::new(
        store,
        grid,
        config.tiers.clone(),
        config.scheduler.clone(),
        Arc::clone(&metrics),
    )?;

    // ── Start background tasks ─────────────────────────────────

    let running = orchestrator.start();

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");

    running.shutdown().await;

    let exposition = render_prometheus(&metrics.snapshot().await);
    info!(deployments = metrics.total().await, "final deployment counters:\n{exposition}");

    info!("gridlease daemon stopped");
    Ok(())
}
