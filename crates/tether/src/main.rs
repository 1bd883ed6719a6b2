//! # tether
//!
//! Tether bridge server binary: loads settings, wires the session store,
//! delta engine and message handlers into the HTTP/WebSocket server, and
//! runs until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::logging::init_subscriber;
use tether_server::config::ServerConfig;
use tether_server::server::TetherServer;
use tether_server::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;
use tether_server::websocket::dispatch::HandlerRegistry;
use tether_session::sweep::{SweepConfig, spawn_sweeper};
use tether_session::{DeltaEngine, SessionStore, TokenIssuer};
use tether_settings::TetherSettings;

/// Tether bridge server.
#[derive(Parser, Debug)]
#[command(
    name = "tether",
    about = "Session and WebSocket bridge between chat clients and an AI generator"
)]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.tether/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<TetherSettings> {
        let path = self.config.clone().unwrap_or_else(tether_settings::settings_path);
        let mut settings = tether_settings::load_settings_from_path(&path)
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
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;
    init_subscriber(&settings.logging.level, settings.logging.format);

    let tokens = match &settings.session.csrf_secret {
        Some(secret) => TokenIssuer::from_secret(secret.as_bytes()),
        None => {
            tracing::info!("no csrf secret configured, using a per-process random secret");
            TokenIssuer::random()
        }
    };
    let store = Arc::new(SessionStore::new(settings.session.timeout_minutes, Arc::new(tokens)));
    let engine = Arc::new(DeltaEngine::new());

    let config = ServerConfig::from(&settings.server);
    let handlers = HandlerRegistry::with_builtin(config.handler_timeout());
    let metrics = tether_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let server = TetherServer::new(config, Arc::clone(&store), Arc::clone(&engine), handlers)
        .with_metrics(metrics);

    let mut handles = Vec::new();
    if settings.session.sweep_enabled {
        let sweep = SweepConfig {
            interval: Duration::from_secs(settings.session.sweep_interval_secs),
            grace: Duration::from_secs(settings.session.sweep_grace_secs),
        };
        handles.push(spawn_sweeper(store, engine, sweep, server.shutdown().child_token()));
    }

    let (addr, serve) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(%addr, "tether ready");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    tracing::info!("shutdown signal received");

    server.shutdown().shutdown();
    if !server.drain_connections(DEFAULT_SHUTDOWN_TIMEOUT).await {
        tracing::warn!("some connections did not close before the drain deadline");
    }
    handles.push(serve);
    server
        .shutdown()
        .graceful_shutdown(handles, Some(DEFAULT_SHUTDOWN_TIMEOUT))
        .await;

    tracing::info!("tether stopped");
    Ok(())
}
