//! Aurora Agent - self-protection runtime host
//!
//! Runs the monitor for this host, feeds its heartbeat and serves the
//! health, metrics and status endpoints.

use anyhow::Result;
use aurora_agent::{
    api,
    config::{AgentConfig, Cli},
};
use aurora_lib::{config::MonitorConfig, Monitor};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting aurora-agent");

    let cli = Cli::parse();
    let config = AgentConfig::load(&cli)?;
    info!(node_name = %config.node_name, port = config.api_port, "Agent configured");

    let monitor_config = MonitorConfig::load(config.config_path.as_deref())?;
    let monitor = Monitor::new(monitor_config)?;
    monitor.start().await?;

    // The agent is its own protected process
    let heartbeat_monitor = monitor.clone();
    let heartbeat_interval = Duration::from_millis(config.heartbeat_interval_ms.max(1));
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            heartbeat_monitor.heartbeat().await;
        }
    });

    let app_state = Arc::new(api::AppState::new(monitor.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
                Ok(Ok(())) => info!("API server exited"),
            }
        }
    }

    heartbeat_handle.abort();
    monitor.stop().await;
    info!("Shutting down");

    Ok(())
}
