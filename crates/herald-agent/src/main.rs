//! # herald
//!
//! Herald notification hub binary: loads settings, starts the hub and
//! serves the WebSocket gateway until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use herald_core::logging::{LogFormat, init_subscriber};
use herald_server::bridge::{LocalBridge, ScaleOutBridge};
use herald_server::{HeraldServer, Hub, HubConfig};
use herald_settings::{BridgeSettings, HeraldSettings};

/// Herald real-time notification hub.
#[derive(Parser, Debug)]
#[command(name = "herald", about = "Herald real-time notification hub")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.herald/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Load settings from the chosen file and apply flag overrides.
    fn settings(&self) -> Result<HeraldSettings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(herald_settings::settings_path);
        let mut settings = herald_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

/// Pick the scale-out bridge from settings.
#[cfg(feature = "redis")]
async fn select_bridge(settings: &BridgeSettings) -> Result<Arc<dyn ScaleOutBridge>> {
    match &settings.redis_url {
        Some(url) => {
            let bridge = herald_server::bridge::RedisBridge::connect(url, &settings.channel)
                .await
                .context("Failed to connect scale-out bridge")?;
            Ok(Arc::new(bridge))
        }
        None => Ok(Arc::new(LocalBridge)),
    }
}

/// Pick the scale-out bridge from settings.
#[cfg(not(feature = "redis"))]
#[allow(clippy::unused_async)]
async fn select_bridge(settings: &BridgeSettings) -> Result<Arc<dyn ScaleOutBridge>> {
    if settings.redis_url.is_some() {
        tracing::warn!("redisUrl is set but herald was built without the redis feature");
    }
    Ok(Arc::new(LocalBridge))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.settings()?;

    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&settings.logging.level, format);

    let metrics = herald_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let bridge = select_bridge(&settings.bridge).await?;
    let hub = Arc::new(Hub::new(HubConfig::from(&settings), bridge));
    hub.start().await.context("Failed to start hub")?;

    let server = HeraldServer::new(hub.clone(), settings.server.clone()).with_metrics(metrics);
    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!("Herald listening on ws://{addr}/ws");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    hub.shutdown().await;
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
