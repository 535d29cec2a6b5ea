//! code-squad daemon: HTTP API, autoscaler and graceful shutdown.

use anyhow::{Context, Result};
use tracing::info;

use cs_core::config::Config;
use cs_daemon::daemon::Daemon;
use cs_telemetry::logging::{init_with_format, LogFormat};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env is fine
    dotenv::dotenv().ok();

    let config = Config::load().context("failed to load configuration")?;
    init_with_format("cs-daemon", "info", LogFormat::parse(&config.daemon.log_format));
    info!(version = env!("CARGO_PKG_VERSION"), "code-squad daemon starting");

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    info!(
        "API server: http://{}:{}",
        daemon.config().daemon.host,
        daemon.config().daemon.port
    );
    daemon.run().await
}
