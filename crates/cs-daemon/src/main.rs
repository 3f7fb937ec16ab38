//! codescope daemon: runs analysis tasks through code agents and serves the
//! task API.

use anyhow::{Context, Result};
use cs_core::config::{Config, LogFormat};
use cs_daemon::daemon::Daemon;
use cs_telemetry::logging::{self, Format};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    let format = match config.general.log_format {
        LogFormat::Pretty => Format::Pretty,
        LogFormat::Json => Format::Json,
    };
    logging::init("cs-daemon", &config.general.log_level, format);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        config = %Config::default_path().display(),
        "codescope daemon starting"
    );

    let daemon = Daemon::new(config).context("failed to initialise daemon")?;
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

    daemon.run().await
}
