//! # JIM Server
//!
//! Multi-user chat server speaking the JIM JSON protocol over TCP.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! jim-server
//!
//! # Run with a config file
//! JIM_CONFIG=/path/to/jim.toml jim-server
//!
//! # Run with environment variables
//! JIM_PORT=7777 JIM_HOST=0.0.0.0 jim-server
//! ```

mod config;
mod connection;
mod console;
mod event_loop;
mod metrics;

use anyhow::{Context, Result};
use jim_core::{Gateway, MemoryGateway};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jim_server=info,jim_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting JIM server on {}:{}", config.host, config.port);

    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    let gateway = Arc::new(match &config.storage.path {
        Some(path) => MemoryGateway::load_from(path)
            .with_context(|| format!("Failed to load snapshot: {}", path.display()))?,
        None => MemoryGateway::new(),
    });

    let event_loop = event_loop::EventLoop::bind(&config, gateway.clone()).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.console {
        let console_gateway: Arc<dyn Gateway> = gateway.clone();
        tokio::spawn(console::run(console_gateway, shutdown_tx.clone()));
    }

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            let _ = signal_tx.send(true);
        }
    });

    event_loop.run(shutdown_rx).await;
    drop(shutdown_tx);

    if let Some(path) = &config.storage.path {
        gateway
            .save_to(path)
            .with_context(|| format!("Failed to save snapshot: {}", path.display()))?;
    }

    Ok(())
}
