//! hyperconnectd: headless hyperconnect node.
//!
//! Runs the full discovery/session/transfer stack and logs outward events
//! until a shutdown signal arrives. Configuration comes from the
//! environment: `HYPERCONNECT_PORT`, `HYPERCONNECT_DOWNLOADS`,
//! `HYPERCONNECT_AUTO_ACCEPT=1`.

use anyhow::Context;
use hyperconnect::{Event, Node, NodeConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hyperconnect=info")),
        )
        .init();

    let mut config = NodeConfig::default();
    if let Ok(port) = std::env::var("HYPERCONNECT_PORT") {
        config.port = port
            .parse()
            .with_context(|| format!("invalid HYPERCONNECT_PORT: {}", port))?;
    }
    if let Ok(dir) = std::env::var("HYPERCONNECT_DOWNLOADS") {
        config.downloads_dir = Some(PathBuf::from(dir));
    }
    config.auto_accept = std::env::var("HYPERCONNECT_AUTO_ACCEPT")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let (node, mut events) = Node::start(config)
        .await
        .context("failed to start node")?;

    info!(
        device_id = %node.device_id(),
        port = node.port(),
        "hyperconnect node running"
    );

    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    node.shutdown().await;
    event_log.abort();
    Ok(())
}

fn log_event(event: &Event) {
    match serde_json::to_string(event) {
        Ok(json) => info!(target: "hyperconnect::event", "{}", json),
        Err(_) => info!(target: "hyperconnect::event", "{}", event.name()),
    }
}
