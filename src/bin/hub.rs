//! Deployable collaboration hub.
//!
//! Configuration comes from `COWRITE_*` environment variables (see
//! `cowrite::config`); `COWRITE_JWT_SECRET` is required. Runs until
//! ctrl-c, then retires every live replica so final snapshots reach the
//! store.

use std::sync::Arc;

use log::{error, info};

use cowrite::{CollabHub, HubConfig, MemoryStore};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = HubConfig::from_env();
    if config.jwt_secret.is_empty() {
        error!("COWRITE_JWT_SECRET is not set; refusing to start");
        std::process::exit(1);
    }

    // TODO: swap MemoryStore for the database-backed store once the
    // metadata service client lands.
    let store = Arc::new(MemoryStore::new());
    let hub = CollabHub::new(config.clone(), store);

    info!("starting collaboration hub on {}", config.bind_addr);

    let runner = hub.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            error!("hub terminated: {e}");
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => error!("failed to listen for shutdown signal: {e}"),
    }

    server.abort();
    hub.shutdown().await;

    let stats = hub.stats().await;
    info!(
        "served {} connections, {} messages ({} bytes)",
        stats.total_connections, stats.total_messages, stats.total_bytes
    );
}
