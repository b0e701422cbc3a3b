//! # turnstream-server
//!
//! Accepts audio streams from capture devices over WebSocket, records them,
//! and in assistant mode cuts them into turns, transcribes accepted turns and
//! answers with control messages.
//!
//! ## Startup:
//! 1. **Loads configuration** from `.env`, config files and environment variables
//! 2. **Sets up logging** through `tracing`
//! 3. **Creates shared state**: metrics, transcription pool, responder
//! 4. **Serves** until SIGINT / SIGTERM, then stops gracefully

use anyhow::Result;
use std::net::TcpListener;
use tracing::{error, info};

use turnstream::config::AppConfig;
use turnstream::server::build_server;
use turnstream::state::AppState;
use turnstream::telemetry::init_tracing;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting turnstream-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        path = %config.server.audio_path,
        mode = config.server.mode.as_str(),
        output_dir = %config.server.output_dir,
        "configuration loaded"
    );

    let listener = TcpListener::bind(config.bind_address())?;
    let state = AppState::new(config);

    info!("Listening on {}", listener.local_addr()?);

    let server = build_server(state, listener, None)?;
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM where the platform has it.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
