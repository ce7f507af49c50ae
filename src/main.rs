use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use gt06_gateway::bus::{MemoryBus, MemoryCommandQueue};
use gt06_gateway::config::GatewayConfig;
use gt06_gateway::session::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => GatewayConfig::load(&path)?,
        None => GatewayConfig::default(),
    };
    info!("starting gt06_gateway on port {}", config.listen.port);

    // Single-node wiring: in-process store, bus and command queue. A
    // clustered deployment substitutes the scripted key-value store and
    // partitioned log clients behind the same interfaces.
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(MemoryBus::new());
    let commands = Arc::new(MemoryCommandQueue::new());

    let shutdown = CancellationToken::new();
    let gateway = tokio::spawn(gt06_gateway::server::run(
        config,
        store,
        bus,
        commands,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    shutdown.cancel();
    gateway.await??;
    Ok(())
}
