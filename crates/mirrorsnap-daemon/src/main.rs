//! `mirrorsnap`: display snapshot daemon.
//!
//! Configuration: `MIRRORSNAP_CONFIG` (JSON file) plus `MIRRORSNAP_QUALITY`,
//! `MIRRORSNAP_INTERVAL_MS`, `MIRRORSNAP_OUTPUT_DIR`, `MIRRORSNAP_AUTOSTART`.
//! Use `RUST_LOG=debug` for per-frame detail, `RUST_LOG=mirrorsnap::artifact=trace`
//! for full base64 payloads.

use anyhow::{Context, Result};
use mirrorsnap_daemon::{app, DaemonConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    info!("mirrorsnap v{}", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig::load().context("Loading configuration")?;

    match app::run(config).await {
        Ok(()) => {
            info!("mirrorsnap exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}
