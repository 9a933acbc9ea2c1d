//! IoT Anchor Server
//!
//! Runs the WebSocket server over an in-memory store and the in-process
//! ledger for the configured target chains.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use iot_anchor::{
    chain::{EnvKeySource, LocalLedger, SigningKey},
    network::{IotServer, ServerConfig},
    service::{EventBus, IotService},
    store::MemoryStore,
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    info!("IoT Anchor Server v{}", VERSION);
    info!(
        "Target chains: {:?}, registrations on {}",
        config.service.target_chains, config.service.default_chain
    );
    if !config.auth.is_configured() {
        warn!("Operator auth not configured; operator actions are open");
    }

    let chains = config.service.target_chains.clone();
    let ledger = match LocalLedger::from_source(&EnvKeySource::default(), chains.clone()) {
        Ok(ledger) => ledger,
        Err(e) => {
            warn!("No signing key ({}); using an ephemeral key", e);
            LocalLedger::new(SigningKey::generate(), chains)
        }
    };
    info!("Signing account {}", ledger.account());

    let service = Arc::new(IotService::new(
        config.service.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ledger),
        EventBus::default(),
    ));
    let server = Arc::new(IotServer::new(config, service));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            signal_server.shutdown();
        }
    });

    server.run().await.context("server failed")?;
    info!("Server stopped");
    Ok(())
}
