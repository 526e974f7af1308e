//! Prism server library.
//!
//! Provides a reusable server function to serve Prism either for the binary,
//! or for the integration tests.

#![deny(missing_docs)]

mod health;
mod logger;

use std::net::SocketAddr;

use anyhow::anyhow;
use axum::{Router, routing::get};
use config::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Configuration for serving Prism.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to
    pub listen_address: SocketAddr,
    /// The deserialized Prism TOML configuration.
    pub config: Config,
    /// Cancellation token for graceful shutdown
    pub shutdown_signal: CancellationToken,
    /// Log filter string (e.g., "info" or "gateway=debug,server=debug")
    pub log_filter: String,
    /// The version string to log on startup
    pub version: String,
    /// Optional oneshot sender to send back the bound address (useful if port 0 was specified)
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

/// Starts and runs the Prism server with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        log_filter,
        version,
        bound_addr_sender,
    }: ServeConfig,
) -> anyhow::Result<()> {
    logger::init(&log_filter);

    // Log the version as the first message after logger initialization
    log::info!("Prism {version}");

    let gateway_router = gateway::router(&config).map_err(|err| {
        log::error!("Failed to initialize gateway router: {err:?}");
        anyhow!("Failed to initialize gateway router: {err}")
    })?;

    let app = Router::new()
        .merge(gateway_router)
        .route("/health", get(health::health));

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    let bound_address = listener.local_addr()?;

    if let Some(sender) = bound_addr_sender {
        sender
            .send(bound_address)
            .expect("Failed to send back bound address.");
    }

    log::info!("Chat completions endpoint: http://{bound_address}/v1/chat/completions");
    log::info!("Upstream: {}", config.upstream.url);
    log::info!("Credential pool size: {}", config.credentials.count);

    // Run with graceful shutdown
    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result.map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;
        }
        _ = shutdown_signal.cancelled() => {
            log::info!("Received shutdown signal, shutting down gracefully...");
        }
    }

    Ok(())
}
