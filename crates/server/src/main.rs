//! ChatGate Server - Main Entry Point

use anyhow::Context;
use chatgate_common::AppConfig;
use chatgate_worker::{ChatService, PretrainedSource};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration first so its log level can seed the filter
    let config_path = std::env::var("CHATGATE_CONFIG").ok().map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    let level = &config.observability.log_level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("chatgate_server={level},chatgate_worker={level},tower_http={level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ChatGate Server v{}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("No CHATGATE_CONFIG set, using defaults and environment"),
    }

    let source = Arc::new(PretrainedSource::from_config(&config.model));
    let service = Arc::new(ChatService::from_config(&config, source)?);

    if config.concurrency.preload {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = service.preload().await {
                warn!("Preload failed, will retry on first request: {}", e);
            }
        });
    }

    if let Err(e) = chatgate_server::serve(&config, service, shutdown_signal()).await {
        error!("Server error: {:#}", e);
        return Err(e);
    }

    info!("ChatGate Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
