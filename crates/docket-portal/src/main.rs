//! # docket-portal
//!
//! Docket portal realtime server binary — wires settings, logging, metrics
//! and the realtime service together and starts the HTTP/WebSocket server.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use docket_realtime::{DevValidator, MemoryCoordinationStore, MemoryNotificationStore, RealtimeService};
use docket_server::config::{ServerConfig, realtime_config};
use docket_server::server::DocketServer;
use docket_settings::DocketSettings;

/// Docket portal realtime server.
#[derive(Parser, Debug)]
#[command(name = "docket-portal", about = "Docket portal realtime server")]
struct Cli {
    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings if specified; 0 auto-assigns).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the settings file (defaults to `~/.docket/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => docket_settings::load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => docket_settings::load_settings().context("failed to load settings")?,
    };
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    docket_logging::init_subscriber(&settings.logging);
    let metrics = docket_server::metrics::install_recorder();

    let service = build_service(&settings);
    let server = DocketServer::new(
        ServerConfig::from_settings(&settings),
        service.clone(),
        metrics,
    );

    let background = service.spawn_background(&server.shutdown().token());
    let (addr, serve) = server
        .listen()
        .await
        .context("failed to bind listen address")?;
    tracing::info!(%addr, "docket portal realtime server started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to install signal handler")?;
    tracing::info!("shutdown signal received");

    server
        .shutdown()
        .graceful_shutdown(background, None)
        .await;
    serve.abort();

    Ok(())
}

/// Wire the realtime service with in-process collaborators.
///
/// Production deployments swap these for the real notification service,
/// identity provider, and shared coordination store at this one seam.
fn build_service(settings: &DocketSettings) -> Arc<RealtimeService> {
    tracing::warn!(
        "using in-process collaborators (dev validator, memory stores); \
         not suitable for production"
    );
    RealtimeService::new(
        realtime_config(settings),
        Arc::new(MemoryCoordinationStore::default()),
        Arc::new(MemoryNotificationStore::new()),
        Arc::new(DevValidator),
    )
}
