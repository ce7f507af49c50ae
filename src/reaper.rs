//! Idle session reaper.
//!
//! Periodically sweeps the registry for sessions whose last activity is
//! past the ceiling (ten minutes authenticated, one minute not) and asks
//! their connections to close, which runs the normal disconnect path.
//! Records whose channel no longer resolves (left behind by a crashed
//! instance) are evicted directly.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::events::{SessionEvent, SessionEventKind};
use crate::handler::GatewayContext;

/// Run the reaper until shutdown.
pub async fn run_reaper(ctx: Arc<GatewayContext>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(ctx.config.reaper.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reaper stopping");
                return;
            }
            _ = interval.tick() => sweep(&ctx).await,
        }
    }
}

/// One pass over the active set.
pub async fn sweep(ctx: &GatewayContext) {
    let now = Utc::now();
    let auth_cutoff = now - chrono::Duration::seconds(ctx.config.session.idle_timeout_s as i64);
    let unauth_cutoff = now - chrono::Duration::seconds(ctx.config.session.unauth_timeout_s as i64);

    let idle = ctx.registry.find_idle(auth_cutoff, unauth_cutoff).await;
    if idle.is_empty() {
        return;
    }
    debug!("reaping {} idle session(s)", idle.len());

    for session_id in idle {
        let record = match ctx.registry.get(&session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                warn!("reaper lookup failed for {}: {}", session_id, e);
                continue;
            }
        };
        match ctx.channels.get(record.channel_id) {
            Some(handle) => {
                info!(
                    "reaping idle session {} for {} (connection {})",
                    record.id, record.imei, record.channel_id
                );
                // The connection's own teardown evicts the record and
                // emits the lifecycle event.
                handle.cancel.cancel();
            }
            None => {
                // Stale record with no live connection behind it.
                info!("evicting stale session {} for {}", record.id, record.imei);
                match ctx.registry.remove(&record.id).await {
                    Ok(Some(removed)) => {
                        let protocol_version = removed
                            .attributes
                            .get("device_type")
                            .and_then(|v| v.parse().ok());
                        ctx.publisher
                            .session_event(SessionEvent {
                                kind: SessionEventKind::Disconnected,
                                session_id: removed.id,
                                imei: removed.imei,
                                remote_addr: removed.remote_addr,
                                protocol_version,
                                at: now,
                            })
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("stale session eviction failed: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::codec;
    use crate::config::{GatewayConfig, PublishConfig, TopicsConfig};
    use crate::frame::Frame;
    use crate::handler::run_connection;
    use crate::imei::Imei;
    use crate::publisher::TelemetryPublisher;
    use crate::records::{DeviceSessionRecord, SessionKind};
    use crate::session::{MemoryStore, SessionRecord, SessionStore};
    use prost::Message as ProstMessage;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const IMEI_STR: &str = "123456789012345";

    fn test_context(
        config: GatewayConfig,
    ) -> (Arc<GatewayContext>, Arc<MemoryStore>, Arc<MemoryBus>) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let (publisher, _pump) = TelemetryPublisher::spawn(
            bus.clone(),
            TopicsConfig::default(),
            PublishConfig {
                retry_base_ms: 1,
                ..PublishConfig::default()
            },
        );
        let ctx = Arc::new(GatewayContext::new(config, store.clone(), publisher));
        (ctx, store, bus)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn idle_session_is_reaped_through_the_connection() {
        let mut config = GatewayConfig::default();
        // Anything idle right now qualifies.
        config.session.idle_timeout_s = 0;
        let (ctx, store, bus) = test_context(config);

        let (mut client, server) = tokio::io::duplex(4096);
        let _conn = tokio::spawn(run_connection(ctx.clone(), server, "10.0.0.1:1".into()));
        let login = Frame::standard(
            codec::PROTO_LOGIN,
            vec![0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45],
            1,
        );
        client.write_all(&login.to_bytes()).await.unwrap();
        let mut ack = [0u8; 10];
        client.read_exact(&mut ack).await.unwrap();
        wait_for(|| !bus.topic_records("device.session").is_empty()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        sweep(&ctx).await;

        // The device socket closes and the record goes away.
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("reaper should close the connection")
            .unwrap();
        assert_eq!(n, 0);
        wait_for(|| bus.topic_records("device.session").len() == 2).await;

        let records = bus.topic_records("device.session");
        let last = DeviceSessionRecord::decode_length_delimited(records[1].payload.clone()).unwrap();
        assert_eq!(last.kind, SessionKind::SessionDisconnected as i32);
        assert_eq!(store.active_count().await.unwrap(), 0);
        assert!(store
            .get_by_imei(&Imei::new(IMEI_STR).unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stale_record_without_channel_is_evicted_directly() {
        let (ctx, store, bus) = test_context(GatewayConfig::default());

        // A record whose channel id resolves to nothing, as after a
        // crash.
        let old = Utc::now() - chrono::Duration::seconds(3600);
        let mut record = SessionRecord::new(Imei::new(IMEI_STR).unwrap(), 999, "10.0.0.1:1", old);
        record.authenticated = true;
        store.create_or_replace(record).await.unwrap();

        sweep(&ctx).await;

        wait_for(|| !bus.topic_records("device.session").is_empty()).await;
        let records = bus.topic_records("device.session");
        let event = DeviceSessionRecord::decode_length_delimited(records[0].payload.clone()).unwrap();
        assert_eq!(event.kind, SessionKind::SessionDisconnected as i32);
        assert_eq!(store.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fresh_sessions_survive_the_sweep() {
        let (ctx, store, _bus) = test_context(GatewayConfig::default());
        let now = Utc::now();
        let mut record = SessionRecord::new(Imei::new(IMEI_STR).unwrap(), 999, "10.0.0.1:1", now);
        record.authenticated = true;
        store.create_or_replace(record).await.unwrap();

        sweep(&ctx).await;
        assert_eq!(store.active_count().await.unwrap(), 1);
    }
}
