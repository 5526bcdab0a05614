//! recollect-server - memory engine over JSON-RPC 2.0
//!
//! Reads one request (or batch) per line on stdin and writes responses to
//! stdout. Logs go to stderr.

use std::sync::Arc;

use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod rpc;
mod services;
mod state;

use services::MaintenanceService;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging (stdout carries the protocol)
    let json_logs = std::env::var("RECOLLECT_LOG_FORMAT").is_ok_and(|v| v == "json");
    tracing_subscriber::registry()
        .with(json_logs.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json_logs).then(|| fmt::layer().with_writer(std::io::stderr)))
        .with(EnvFilter::from_default_env().add_directive("recollect_server=info".parse()?))
        .init();

    info!("recollect-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = config::Config::load()?;
    info!("Config loaded from {:?}", config.config_path);

    let maintenance_interval = config.server.maintenance_interval_secs;
    let maintenance_dry_run = config.server.maintenance_dry_run;
    let state = AppState::new(config);

    let maintenance = Arc::new(MaintenanceService::new(state.clone(), maintenance_dry_run));
    if maintenance_interval > 0 {
        Arc::clone(&maintenance).start(maintenance_interval).await;
    }

    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();

    tokio::select! {
        result = rpc::serve(&state, reader, writer) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    info!("Shutting down...");
    maintenance.stop().await;
    let flushed = state.shutdown().await;
    info!(flushed_events = flushed, "Shutdown complete");

    Ok(())
}
