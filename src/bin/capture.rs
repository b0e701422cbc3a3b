//! # turnstream-capture
//!
//! The device side of the stream: replays a raw capture dump through the
//! conditioning chain and streams it to the server, reconnecting forever.
//!
//! Runs on a single-threaded runtime; the supervisor is one cooperative loop.

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use turnstream::capture::{AlwaysUp, CaptureSupervisor, RawFileBackend};
use turnstream::config::AppConfig;
use turnstream::telemetry::init_tracing;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    let capture = &config.capture;
    info!(
        server = %capture.server_url,
        source = %capture.source_path,
        looped = capture.loop_source,
        "Starting turnstream-capture v{}",
        env!("CARGO_PKG_VERSION")
    );

    let backend = RawFileBackend::new(&capture.source_path, capture.loop_source);
    let mut supervisor = match CaptureSupervisor::new(config.supervisor_config(), backend, AlwaysUp) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "capture layout rejected");
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            // keep the sender alive, a dropped sender also stops the supervisor
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT, stopping capture");
        let _ = shutdown_tx.send(true);
    });

    supervisor.run(shutdown_rx).await;

    info!(attempts = supervisor.attempts(), "capture stopped");
    Ok(())
}
