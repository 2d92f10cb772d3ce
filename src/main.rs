//! Tactics Sync Server
//!
//! Runs the reference game server with in-memory storage.
//! Configuration comes from the environment (see `ServerConfig::from_env`
//! and `AuthConfig::from_env`).

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tactics_sync::{
    network::{AuthConfig, GameServer, ServerConfig, TokenVerifier},
    MemoryGameStore, PROTOCOL_VERSION, VERSION,
};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Tactics Sync Server v{}", VERSION);
    info!("Protocol version: {}", PROTOCOL_VERSION);

    let config = ServerConfig::from_env();
    let verifier = TokenVerifier::new(&AuthConfig::from_env())
        .context("token verification needs AUTH_SECRET or AUTH_PUBLIC_KEY_PEM")?;
    info!("Binding to {}", config.bind_addr);

    let server = Arc::new(GameServer::new(config, verifier, Arc::new(MemoryGameStore::new())));

    let shutdown = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
