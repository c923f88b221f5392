//! registry-daemon: Service registry server.
//!
//! Accepts instance registrations over WebSocket, evicts expired leases and
//! replicates every change to the configured peers.

use anyhow::Result;
use clap::Parser;
use registry_core::SystemClock;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use registry_daemon::{Args, RegistryNode, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::try_from(args)?;
    info!("Starting registry-daemon");
    info!("Server ID: {}", config.server_id);
    info!("Peers: {:?}", config.peers);

    let node = RegistryNode::new(config, Arc::new(SystemClock));
    let mut handle = node.start().await?;

    let synced = node.sync_up().await;
    info!("Initial sync copied {} instance(s)", synced);

    match node.self_register(&mut handle).await {
        Ok(record) => info!("Advertised as {}", record.id()),
        Err(e) => warn!("Self-registration failed: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.shutdown();

    Ok(())
}
