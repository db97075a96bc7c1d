pub mod auth;
pub mod config;
pub mod smtp;
pub mod tls;
pub mod webhook;

use anyhow::{Context, Result};
use log::{error, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = match config::ServerConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let dispatcher = Arc::new(
        webhook::WebhookDispatcher::new(&config).context("Failed to build webhook client")?,
    );
    let authenticator = auth::from_config(&config);
    let backend = smtp::WebhookBackend::new(Arc::clone(&config), dispatcher, authenticator);

    let tls = if config.tls_enabled {
        Some(tls::acceptor_from_config(&config).context("TLS is enabled but no certificate is available")?)
    } else {
        None
    };

    let server = smtp::SmtpServer::bind(Arc::clone(&config), backend, tls).await?;

    let shutdown = CancellationToken::new();
    let serve = tokio::spawn(server.serve(shutdown.clone()));

    tokio::select! {
        result = serve => {
            // The accept loop only returns on its own when it failed.
            result.context("SMTP listener task panicked")??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for the shutdown signal")?;
            info!("Shutdown signal received, stopping listener...");
            shutdown.cancel();
        }
    }

    info!("Shutdown complete");
    Ok(())
}
