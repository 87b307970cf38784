//! livegrid node: runs a sync node or the relay broker.
//!
//! Configured through environment variables (a `.env` file is honoured);
//! log level through `RUST_LOG`.

mod config;
mod seed;

use std::error::Error;

use livegrid_sync::relay::RelayServer;
use livegrid_sync::server::SyncServer;

use config::{NodeConfig, Role};

async fn run_node(config: &NodeConfig) -> Result<(), Box<dyn Error>> {
    let server = SyncServer::new(config.server_config())?;

    if config.seed_count > 0 {
        seed::seed_if_empty(server.node().store().as_ref(), config.seed_count, config.seed_batch)?;
    }

    log::info!(
        "Node {} on {} (relay: {})",
        server.node().identity(),
        server.bind_addr(),
        config.relay_url.as_deref().unwrap_or("none")
    );

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down node {}", server.node().identity());
        }
    }

    server.node().shutdown().await;
    log::info!("Final stats: {:?}", server.stats());
    Ok(())
}

async fn run_relay(config: &NodeConfig) -> Result<(), Box<dyn Error>> {
    let relay = RelayServer::new(config.relay_config());

    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down relay");
        }
    }

    log::info!("Final stats: {:?}", relay.stats().await);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = NodeConfig::from_env()?;
    env_logger::init();

    log::info!("Starting livegrid {:?}...", config.role);
    match config.role {
        Role::Node => run_node(&config).await,
        Role::Relay => run_relay(&config).await,
    }
}
