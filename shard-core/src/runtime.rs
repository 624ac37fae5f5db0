//! Composition root for the relay process
//!
//! Wires the JSON store, the upstream chain follower, the relay and the HTTP
//! API together, then serves until Ctrl+C.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::{info, warn};

use crate::api::create_router;
use crate::chain::ChainError;
use crate::config::Config;
use crate::follower::HttpChain;
use crate::metrics::Metrics;
use crate::persist::{JsonPersist, PersistError};
use crate::relay::{Relay, RelayError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the relay with the given configuration
pub async fn run_relay(config: Config) -> Result<(), RuntimeError> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let persist = Arc::new(JsonPersist::new(&config.data_dir));
    info!("Host index stored at {}", persist.path().display());

    let chain = Arc::new(HttpChain::new(&config.upstream, config.poll_interval())?);
    info!("Following chain at {}", config.upstream);

    let relay = Relay::new(chain, persist, config.save_delay(), Metrics::new()).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API listening on {}", listener.local_addr()?);

    axum::serve(listener, create_router(relay.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match relay.flush().await {
        Ok(true) => info!("Saved pending host index changes"),
        Ok(false) => {}
        Err(e) => warn!("Failed to save host index on shutdown: {}", e),
    }

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down...");
}
