//! Command consumer.
//!
//! Drains the `device.command` topic and hands each command to the
//! connection that owns the target device. The consumer never touches a
//! socket: delivery goes through the connection's bounded channel and is
//! confirmed over a oneshot once the frame has been written. A command
//! with no live session is requeued up to its retry budget, then
//! surfaced as a failure record on the telemetry topic.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::bus::CommandSource;
use crate::events::{CommandEvent, CommandFailure};
use crate::handler::{GatewayContext, OutboundCommand};

/// Pause before requeueing an undeliverable command, so a device that
/// is reconnecting has a moment to log back in.
const REQUEUE_DELAY: Duration = Duration::from_millis(100);

/// Extra slack on top of the socket write timeout when awaiting the
/// connection's delivery confirmation.
const CONFIRM_SLACK: Duration = Duration::from_secs(2);

/// Run the consumer until the source closes or shutdown is requested.
pub async fn run_command_consumer(
    ctx: Arc<GatewayContext>,
    source: Arc<dyn CommandSource>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("command consumer stopping");
                return;
            }
            next = source.next() => match next {
                Some(event) => handle_command(&ctx, source.as_ref(), event).await,
                None => {
                    debug!("command source closed");
                    return;
                }
            },
        }
    }
}

async fn handle_command(ctx: &GatewayContext, source: &dyn CommandSource, event: CommandEvent) {
    let command_id = event.command_id.clone();
    if deliver(ctx, &event).await {
        debug!("command {} delivered to {}", command_id, event.imei);
        source.ack(&command_id).await;
    } else {
        requeue_or_fail(ctx, source, event).await;
    }
}

/// Attempt delivery through the live connection. Any miss (no session,
/// unauthenticated, dead channel, failed or timed-out write) reads as
/// "no live session".
async fn deliver(ctx: &GatewayContext, event: &CommandEvent) -> bool {
    let record = match ctx.registry.get_by_imei(&event.imei).await {
        Ok(Some(record)) => record,
        Ok(None) => return false,
        Err(e) => {
            warn!("registry lookup failed for {}: {}", event.imei, e);
            return false;
        }
    };
    if !record.authenticated {
        return false;
    }
    let Some(handle) = ctx.channels.get(record.channel_id) else {
        return false;
    };

    let (done_tx, done_rx) = oneshot::channel();
    let outbound = OutboundCommand {
        event: event.clone(),
        done: done_tx,
    };
    if handle.commands.send(outbound).await.is_err() {
        return false;
    }
    let confirm_limit = ctx.config.listen.write_timeout() + CONFIRM_SLACK;
    matches!(
        tokio::time::timeout(confirm_limit, done_rx).await,
        Ok(Ok(true))
    )
}

async fn requeue_or_fail(ctx: &GatewayContext, source: &dyn CommandSource, mut event: CommandEvent) {
    let budget = if event.max_retries > 0 {
        event.max_retries
    } else {
        ctx.config.command.retry_max
    };
    if event.retry_count >= budget {
        info!(
            "command {} for {} undeliverable after {} attempts",
            event.command_id, event.imei, event.retry_count + 1
        );
        ctx.publisher.command_failed(CommandFailure {
            command_id: event.command_id,
            imei: event.imei,
            reason: "no live session".to_owned(),
            at: Utc::now(),
        });
        return;
    }
    event.retry_count += 1;
    debug!(
        "command {} for {} requeued (attempt {})",
        event.command_id, event.imei, event.retry_count
    );
    tokio::time::sleep(REQUEUE_DELAY).await;
    if let Err(e) = source.requeue(event).await {
        warn!("command requeue failed: {}", e);
    }
}
