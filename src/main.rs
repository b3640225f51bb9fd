//! # keel - controller entry point
//!
//! ## Initialization Sequence
//!
//! 1. **Configuration** - defaults, TOML file, `KEEL_*` environment, CLI flags
//! 2. **Manifests** - load and convert every manifest path
//! 3. **Controller** - start the reconciliation loop against the in-memory cluster
//! 4. **Submission** - submit every spec; rejected specs are logged and skipped
//! 5. **Axum API** - optionally serve the HTTP API
//!
//! ## Shutdown
//!
//! Ctrl+C stops the API server, then the loop. Workers finish their current
//! reconcile before exiting and the final status of every resource is logged.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod manifest;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use keel_core::ResultExt;
use keel_reconciler::{Controller, ControllerConfig, InMemoryCluster, diff, validate_spec};
use keel_web::AppState;
use serde::Serialize;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            manifests,
            config,
            workers,
            listen,
        } => run(&manifests, config.as_deref(), workers, listen).await,
        Commands::Plan { manifests, json } => plan(&manifests, json),
    }
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&Path>, workers: Option<usize>) -> Result<ControllerConfig> {
    let config = ControllerConfig::load(path).context("Failed to load controller config")?;
    let config = match workers {
        Some(workers) => config.with_workers(workers),
        None => config,
    };
    config.validate().context("Invalid controller config")?;
    Ok(config)
}

async fn run(
    manifests: &[PathBuf],
    config_path: Option<&Path>,
    workers: Option<usize>,
    listen: Option<SocketAddr>,
) -> Result<()> {
    let start_time = Instant::now();
    info!("keel starting...");

    let config = load_config(config_path, workers)?;
    let specs = manifest::load_paths(manifests).context("Failed to load manifests")?;
    info!(count = specs.len(), workers = config.workers, "Manifests loaded");

    let cluster = Arc::new(InMemoryCluster::default());
    let controller = Controller::new(cluster, config).context("Failed to create controller")?;
    let running = controller.start();

    let accepted = controller
        .submit_all(specs)
        .await
        .into_iter()
        .filter_map(ResultExt::into_option_logged)
        .count();
    info!(accepted, "Specs submitted");

    let (stop_tx, stop_rx) = watch::channel(false);
    let server = listen.map(|addr| {
        let state = AppState::new(controller.clone());
        let mut stop_rx = stop_rx.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.changed().await;
            };
            keel_web::run_server(addr, state, shutdown).await
        })
    });

    info!(
        "keel started in {:?}. Press Ctrl+C to stop.",
        start_time.elapsed()
    );
    wait_for_shutdown().await;

    stop_tx.send_replace(true);
    if let Some(server) = server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("API server exited with error: {}", err),
            Err(err) => error!("API server task failed: {}", err),
        }
    }
    running
        .shutdown()
        .await
        .context("Reconciliation loop did not stop cleanly")?;

    for status in controller.list_status().await {
        info!(
            id = %status.id,
            phase = %status.phase,
            health = ?status.health,
            observed_generation = status.observed_generation,
            last_error = status.last_error.as_deref().unwrap_or(""),
            "Final status"
        );
    }

    info!("keel stopped gracefully");
    Ok(())
}

#[derive(Serialize)]
struct PlanEntry {
    id: String,
    actions: Vec<keel_reconciler::Action>,
}

fn plan(manifests: &[PathBuf], json: bool) -> Result<()> {
    let specs = manifest::load_paths(manifests).context("Failed to load manifests")?;

    let entries = specs
        .into_iter()
        .filter(|spec| {
            validate_spec(spec)
                .map_err(|err| format!("{}: {err}", spec.id))
                .into_option_logged()
                .is_some()
        })
        .map(|spec| PlanEntry {
            id: spec.id.to_string(),
            actions: diff(&spec, None),
        })
        .collect::<Vec<_>>();

    if json {
        let rendered =
            serde_json::to_string_pretty(&entries).context("Failed to render plan as JSON")?;
        println!("{rendered}");
        return Ok(());
    }

    for entry in &entries {
        println!("{} ({} actions)", entry.id, entry.actions.len());
        for (step, action) in entry.actions.iter().enumerate() {
            println!("  {}. {action}", step.saturating_add(1));
        }
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
