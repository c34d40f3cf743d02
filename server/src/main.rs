//! Rewind Server – development server that records client sessions and
//! replays them deterministically.
//!
//! This binary:
//! 1. Reads configuration from `rewind.conf` (or the path given as the
//!    first argument)
//! 2. Opens the recorder and replayer WebSocket control channels
//! 3. Proxies the API namespace to the live API server, capturing or
//!    substituting responses while a session is recorded or replayed.

mod fetch;
mod interceptor;
mod recorder;
mod replayer;
mod server;
mod sessions;
mod store;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = rewind_common::config::load_or_default(config_path.as_deref())
        .context("Config load failed")?;

    info!(
        "Rewind Server starting (listen={}, upstream={})",
        config.listen_addr, config.api_upstream_url
    );

    std::fs::create_dir_all(&config.recordings_dir)
        .context("Cannot create recordings directory")?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── HTTP server ──────────────────────────────────────────────────
    server::run(&config, shutdown).await?;

    info!("Rewind Server stopped");
    Ok(())
}
