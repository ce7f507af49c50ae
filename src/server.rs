//! Listener and process assembly.
//!
//! Binds the device port, spawns one task per accepted connection and
//! the background tasks (publisher pump, idle reaper, command consumer),
//! and tears everything down on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::bus::{CommandSource, EventBus};
use crate::command::run_command_consumer;
use crate::config::GatewayConfig;
use crate::handler::{run_connection, GatewayContext};
use crate::publisher::TelemetryPublisher;
use crate::reaper::run_reaper;
use crate::session::SessionStore;

/// Run the gateway until `shutdown` fires.
pub async fn run(
    config: GatewayConfig,
    store: Arc<dyn SessionStore>,
    bus: Arc<dyn EventBus>,
    commands: Arc<dyn CommandSource>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (publisher, pump) =
        TelemetryPublisher::spawn(bus, config.topics.clone(), config.publish.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen.port));
    let ctx = Arc::new(GatewayContext::new(config, store, publisher));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("listening for GT06 devices on {}", addr);

    serve(listener, ctx.clone(), commands, shutdown).await;

    info!("shutting down, closing {} connection(s)", ctx.channels.len());
    ctx.channels.cancel_all();
    // Let the connection tasks drain their disconnect events, then stop
    // the pump by dropping the last producer handle.
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(ctx);
    if tokio::time::timeout(Duration::from_secs(2), pump).await.is_err() {
        warn!("publisher pump did not drain in time");
    }
    Ok(())
}

/// Accept connections until shutdown. Exposed separately so tests can
/// drive an ephemeral listener.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<GatewayContext>,
    commands: Arc<dyn CommandSource>,
    shutdown: CancellationToken,
) {
    let reaper = tokio::spawn(run_reaper(ctx.clone(), shutdown.child_token()));
    let consumer = tokio::spawn(run_command_consumer(
        ctx.clone(),
        commands,
        shutdown.child_token(),
    ));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        warn!("set_nodelay failed for {}: {}", peer, e);
                    }
                    tokio::spawn(run_connection(ctx.clone(), socket, peer.to_string()));
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    let _ = reaper.await;
    let _ = consumer.await;
}
