mod bridge;
mod codec;
mod config;
mod connection;
mod db;
mod dispatch;
mod errors;
mod http;
mod metrics;
mod model;
mod mqtt;
mod router;

use anyhow::Context;
use bridge::Bridge;
use config::Settings;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env().context("invalid configuration")?;

    info!("Starting MQTT bridge");
    info!("MQTT broker: {}:{}", settings.broker_host, settings.broker_port);
    info!("Instance id: {}", settings.client_id);
    info!("Database: {}", settings.database_path.display());
    info!("HTTP server: {}", settings.http_addr);

    metrics::init_metrics().context("failed to register metrics")?;

    let mut bridge = Bridge::start(&settings)
        .await
        .context("failed to start bridge")?;

    let app = http::create_router(bridge.connection_state());
    let listener = tokio::net::TcpListener::bind(&settings.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", settings.http_addr))?;
    info!("HTTP server listening on {}", settings.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    let outcome = tokio::select! {
        result = bridge.closed() => {
            error!("MQTT connection loop terminated");
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    bridge.stop().await;
    server_handle.abort();

    info!("Shutting down");
    outcome.context("bridge stopped after losing the broker")
}
