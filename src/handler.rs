//! Per-connection protocol handler.
//!
//! One task owns each accepted socket and everything per-connection: the
//! decode buffer, the write half, the outbound serial counter. The state
//! machine is small: a connection must present a login frame first; every
//! later frame updates activity, is acknowledged, and becomes a telemetry
//! event. The acknowledgement is written and flushed before the event is
//! queued, so the device's retransmit timer is cleared before downstream
//! sees the data.
//!
//! Other components never touch the socket. The command consumer submits
//! through a bounded per-connection channel drained here, and the reaper
//! requests closure through the connection's cancellation token.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, CodecError};
use crate::config::GatewayConfig;
use crate::events::{CommandEvent, SessionEvent, SessionEventKind, TelemetryEvent};
use crate::frame::{Frame, FrameCodec};
use crate::imei::Imei;
use crate::message::{Message, MessageBody};
use crate::publisher::TelemetryPublisher;
use crate::registry::SessionRegistry;
use crate::session::{ChannelId, LastPosition, SessionStore, StoreError};

/// Commands queued per connection before backpressure applies.
const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Errors that terminate a connection.
#[derive(Debug)]
pub enum ConnError {
    Transport(io::Error),
    /// A socket write exceeded its deadline.
    WriteTimeout,
    /// The registry failed on a mutation that must not be lost.
    Registry(StoreError),
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnError::Transport(e) => write!(f, "transport error: {}", e),
            ConnError::WriteTimeout => write!(f, "write timed out"),
            ConnError::Registry(e) => write!(f, "registry error: {}", e),
        }
    }
}

impl std::error::Error for ConnError {}

impl From<io::Error> for ConnError {
    fn from(err: io::Error) -> ConnError {
        ConnError::Transport(err)
    }
}

impl From<StoreError> for ConnError {
    fn from(err: StoreError) -> ConnError {
        ConnError::Registry(err)
    }
}

/// A command on its way to a device, with a completion signal back to
/// the consumer.
#[derive(Debug)]
pub struct OutboundCommand {
    pub event: CommandEvent,
    /// Receives `true` once the frame reached the socket.
    pub done: oneshot::Sender<bool>,
}

/// Handle to one live connection.
#[derive(Clone)]
pub struct ChannelHandle {
    pub commands: mpsc::Sender<OutboundCommand>,
    pub cancel: CancellationToken,
}

/// Resolves logical channel ids to live connections. Session records
/// store only the id; this map is the single place ids become handles.
#[derive(Default)]
pub struct ChannelMap {
    next: AtomicU64,
    inner: DashMap<ChannelId, ChannelHandle>,
}

impl ChannelMap {
    pub fn new() -> ChannelMap {
        ChannelMap::default()
    }

    /// Allocate an id and register the connection's control endpoints.
    pub fn register(
        &self,
    ) -> (
        ChannelId,
        mpsc::Receiver<OutboundCommand>,
        CancellationToken,
    ) {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        self.inner.insert(
            id,
            ChannelHandle {
                commands: tx,
                cancel: cancel.clone(),
            },
        );
        (id, rx, cancel)
    }

    pub fn get(&self, id: ChannelId) -> Option<ChannelHandle> {
        self.inner.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: ChannelId) {
        self.inner.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Ask every live connection to close; used at shutdown.
    pub fn cancel_all(&self) {
        for entry in self.inner.iter() {
            entry.cancel.cancel();
        }
    }
}

/// Shared dependencies of every connection task.
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub registry: SessionRegistry,
    pub channels: ChannelMap,
    pub publisher: TelemetryPublisher,
}

impl GatewayContext {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn SessionStore>,
        publisher: TelemetryPublisher,
    ) -> GatewayContext {
        let registry = SessionRegistry::new(store, config.session.touch_min_interval());
        GatewayContext {
            config,
            registry,
            channels: ChannelMap::new(),
            publisher,
        }
    }
}

#[derive(Clone)]
struct SessionCtx {
    id: String,
    imei: Imei,
    device_type: Option<u16>,
}

/// Sliding window over recent decode failures.
struct FailureWindow {
    limit: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl FailureWindow {
    fn new(limit: usize, window: Duration) -> FailureWindow {
        FailureWindow {
            limit,
            window,
            hits: VecDeque::new(),
        }
    }

    /// Record a failure; returns true once the threshold is crossed.
    fn note(&mut self) -> bool {
        let now = Instant::now();
        self.hits.push_back(now);
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.len() >= self.limit
    }
}

/// Serve one accepted connection until it closes, then tear down its
/// session state.
pub async fn run_connection<S>(ctx: Arc<GatewayContext>, socket: S, remote_addr: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (channel_id, mut commands, cancel) = ctx.channels.register();
    debug!("connection {} open from {}", channel_id, remote_addr);

    let frame_codec = FrameCodec::new(
        ctx.config.decoder.max_frame_bytes,
        ctx.config.decoder.search_window_bytes,
    );
    let mut framed = Framed::new(socket, frame_codec);
    let mut connection = Connection {
        ctx: ctx.clone(),
        channel_id,
        remote_addr,
        session: None,
        outbound_serial: 0,
        failures: FailureWindow::new(
            ctx.config.decoder.failure_limit,
            ctx.config.decoder.failure_window(),
        ),
    };

    if let Err(e) = connection.serve(&mut framed, &mut commands, &cancel).await {
        debug!("connection {} closing on error: {}", channel_id, e);
    }

    ctx.channels.remove(channel_id);
    commands.close();
    connection.teardown().await;
    debug!("connection {} closed", channel_id);
}

struct Connection {
    ctx: Arc<GatewayContext>,
    channel_id: ChannelId,
    remote_addr: String,
    session: Option<SessionCtx>,
    outbound_serial: u16,
    failures: FailureWindow,
}

impl Connection {
    async fn serve<S>(
        &mut self,
        framed: &mut Framed<S, FrameCodec>,
        commands: &mut mpsc::Receiver<OutboundCommand>,
        cancel: &CancellationToken,
    ) -> Result<(), ConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            // Before login a connection gets the short no-auth deadline;
            // afterwards the transport read timeout, with the idle reaper
            // enforcing the longer session ceiling.
            let read_limit = if self.session.is_some() {
                self.ctx.config.listen.read_timeout()
            } else {
                self.ctx.config.session.unauth_timeout()
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("connection {} cancelled", self.channel_id);
                    return Ok(());
                }
                outbound = commands.recv() => {
                    match outbound {
                        Some(command) => self.deliver_command(framed, command).await?,
                        None => return Ok(()),
                    }
                }
                next = tokio::time::timeout(read_limit, framed.next()) => match next {
                    Err(_) => {
                        info!(
                            "connection {} timed out ({})",
                            self.channel_id,
                            if self.session.is_some() { "idle" } else { "no login" }
                        );
                        return Ok(());
                    }
                    Ok(None) => {
                        debug!("connection {} reached EOF", self.channel_id);
                        return Ok(());
                    }
                    Ok(Some(Err(e))) => return Err(ConnError::Transport(e)),
                    Ok(Some(Ok(frame))) => {
                        if !self.handle_frame(framed, frame).await? {
                            return Ok(());
                        }
                    }
                },
            }
        }
    }

    /// Process one frame; returns false when the connection should close.
    async fn handle_frame<S>(
        &mut self,
        framed: &mut Framed<S, FrameCodec>,
        frame: Frame,
    ) -> Result<bool, ConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let received_at = Utc::now();

        if !frame.crc_ok {
            return self.handle_crc_failure(framed, &frame).await;
        }

        let decoded = codec::decode(&frame);

        if self.session.is_none() {
            return match decoded {
                Ok(MessageBody::Login(login)) => {
                    self.handle_login(framed, login, &frame, received_at).await?;
                    Ok(true)
                }
                Ok(body) => {
                    info!(
                        "pre-login {} frame from {}, closing",
                        body.kind().name(),
                        self.remote_addr
                    );
                    Ok(false)
                }
                Err(e) => {
                    info!("undecodable pre-login frame from {} ({}), closing", self.remote_addr, e);
                    Ok(false)
                }
            };
        }

        match decoded {
            Ok(body) => self.handle_authenticated(framed, body, &frame, received_at).await,
            Err(CodecError::UnknownProtocol(protocol)) => {
                debug!(
                    "unknown protocol 0x{:02x} from {}, answering generically",
                    protocol, self.remote_addr
                );
                self.touch(received_at).await;
                self.send_frame(framed, codec::encode_ack(frame.protocol, frame.serial))
                    .await?;
                // Counts against the same failure window as the other
                // protocol errors; a device hammering unsupported codes
                // is disconnected once the threshold is crossed.
                Ok(!self.note_failure())
            }
            Err(e) => {
                warn!("decode failure from {}: {}", self.remote_addr, e);
                self.touch(received_at).await;
                self.send_frame(framed, codec::encode_ack(frame.protocol, frame.serial))
                    .await?;
                Ok(!self.note_failure())
            }
        }
    }

    async fn handle_login<S>(
        &mut self,
        framed: &mut Framed<S, FrameCodec>,
        login: crate::message::Login,
        frame: &Frame,
        now: DateTime<Utc>,
    ) -> Result<(), ConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let outcome = self
            .ctx
            .registry
            .create_or_replace(&login.imei, self.channel_id, &self.remote_addr, now)
            .await?;

        // A second login replaces the first: the displaced connection is
        // told to close and its Disconnected precedes our Connected on
        // the partition.
        if let Some(old) = outcome.replaced {
            info!(
                "device {} logged in again, displacing session {}",
                login.imei, old.id
            );
            if let Some(handle) = self.ctx.channels.get(old.channel_id) {
                handle.cancel.cancel();
            }
            let protocol_version = old
                .attributes
                .get("device_type")
                .and_then(|v| v.parse().ok());
            self.ctx
                .publisher
                .session_event(SessionEvent {
                    kind: SessionEventKind::Disconnected,
                    session_id: old.id,
                    imei: old.imei,
                    remote_addr: old.remote_addr,
                    protocol_version,
                    at: now,
                })
                .await;
        }

        self.ctx.registry.authenticate(&outcome.session.id, now).await?;
        if let Some(type_id) = login.type_id {
            self.ctx
                .registry
                .set_attribute(&outcome.session.id, "device_type", &type_id.to_string())
                .await;
        }

        info!(
            "device {} authenticated on connection {} ({})",
            login.imei, self.channel_id, self.remote_addr
        );
        self.session = Some(SessionCtx {
            id: outcome.session.id.clone(),
            imei: login.imei.clone(),
            device_type: login.type_id,
        });

        self.send_frame(framed, codec::encode_ack(frame.protocol, frame.serial))
            .await?;
        self.ctx
            .publisher
            .session_event(SessionEvent {
                kind: SessionEventKind::Connected,
                session_id: outcome.session.id,
                imei: login.imei.clone(),
                remote_addr: self.remote_addr.clone(),
                protocol_version: login.type_id,
                at: now,
            })
            .await;

        let message = Message {
            imei: login.imei.clone(),
            protocol: frame.protocol,
            serial: frame.serial,
            received_at: now,
            body: MessageBody::Login(login),
        };
        self.ctx
            .publisher
            .telemetry_event(TelemetryEvent::from_message(&message, frame.to_hex()));
        Ok(())
    }

    async fn handle_authenticated<S>(
        &mut self,
        framed: &mut Framed<S, FrameCodec>,
        body: MessageBody,
        frame: &Frame,
        received_at: DateTime<Utc>,
    ) -> Result<bool, ConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(session) = self.session.clone() else {
            return Ok(true);
        };
        self.ctx.registry.touch(&session.id, received_at).await;

        if matches!(body, MessageBody::Login(_)) {
            // The identity is already bound; the repeat is acknowledged
            // like any other message and does not re-authenticate.
            debug!("repeated login from {} ignored", session.imei);
        }

        let fix = match &body {
            MessageBody::Location(fix) => Some(*fix),
            MessageBody::Alarm(alarm) => Some(alarm.fix),
            _ => None,
        };
        if let Some(fix) = fix {
            self.ctx
                .registry
                .update_position(
                    &session.id,
                    LastPosition {
                        latitude: fix.latitude,
                        longitude: fix.longitude,
                        at: fix.device_time,
                    },
                )
                .await;
        }

        // Acknowledge first; the telemetry event is queued only after
        // the ack has been flushed to the socket.
        self.send_frame(framed, codec::encode_ack(frame.protocol, frame.serial))
            .await?;

        let message = Message {
            imei: session.imei.clone(),
            protocol: frame.protocol,
            serial: frame.serial,
            received_at,
            body,
        };
        self.ctx
            .publisher
            .telemetry_event(TelemetryEvent::from_message(&message, frame.to_hex()));
        Ok(true)
    }

    async fn handle_crc_failure<S>(
        &mut self,
        framed: &mut Framed<S, FrameCodec>,
        frame: &Frame,
    ) -> Result<bool, ConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match codec::decode_lenient(frame) {
            Ok(body) => debug!(
                "CRC mismatch on {} frame from {}, answering without acting",
                body.kind().name(),
                self.remote_addr
            ),
            Err(e) => debug!(
                "CRC mismatch on undecodable frame from {}: {}",
                self.remote_addr, e
            ),
        }
        // The error response: the echo ack, with no state transition and
        // nothing published.
        self.send_frame(framed, codec::encode_ack(frame.protocol, frame.serial))
            .await?;
        Ok(!self.note_failure())
    }

    async fn deliver_command<S>(
        &mut self,
        framed: &mut Framed<S, FrameCodec>,
        command: OutboundCommand,
    ) -> Result<(), ConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let OutboundCommand { event, done } = command;
        if self.session.is_none() {
            // Raced a disconnect; the consumer treats this as no session.
            let _ = done.send(false);
            return Ok(());
        }
        self.outbound_serial = self.outbound_serial.wrapping_add(1);
        let frame = codec::encode_command(
            &event.command_text,
            u32::from(self.outbound_serial),
            self.outbound_serial,
        );
        info!(
            "sending command {} to {} on connection {}",
            event.command_id, event.imei, self.channel_id
        );
        match self.send_frame(framed, frame).await {
            Ok(()) => {
                let _ = done.send(true);
                Ok(())
            }
            Err(e) => {
                let _ = done.send(false);
                Err(e)
            }
        }
    }

    async fn send_frame<S>(
        &mut self,
        framed: &mut Framed<S, FrameCodec>,
        frame: Frame,
    ) -> Result<(), ConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(self.ctx.config.listen.write_timeout(), framed.send(frame)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnError::Transport(e)),
            Err(_) => Err(ConnError::WriteTimeout),
        }
    }

    async fn touch(&self, at: DateTime<Utc>) {
        if let Some(session) = &self.session {
            self.ctx.registry.touch(&session.id, at).await;
        }
    }

    fn note_failure(&mut self) -> bool {
        if self.failures.note() {
            warn!(
                "connection {} exceeded {} decode failures in {:?}, closing",
                self.channel_id, self.ctx.config.decoder.failure_limit,
                self.ctx.config.decoder.failure_window()
            );
            true
        } else {
            false
        }
    }

    /// Evict the session and emit its Disconnected event, unless another
    /// path (a replacing login) already did.
    async fn teardown(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match self.ctx.registry.remove(&session.id).await {
            Ok(Some(record)) => {
                self.ctx
                    .publisher
                    .session_event(SessionEvent {
                        kind: SessionEventKind::Disconnected,
                        session_id: record.id,
                        imei: record.imei,
                        remote_addr: record.remote_addr,
                        protocol_version: session.device_type,
                        at: Utc::now(),
                    })
                    .await;
            }
            Ok(None) => {}
            Err(e) => warn!("session eviction failed for {}: {}", session.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::{GatewayConfig, PublishConfig, TopicsConfig};
    use crate::records::{DeviceSessionRecord, SessionKind, TelemetryRecord};
    use crate::session::MemoryStore;
    use prost::Message as ProstMessage;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const IMEI_BCD: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45];
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

    fn login_bytes(serial: u16) -> Vec<u8> {
        Frame::standard(codec::PROTO_LOGIN, IMEI_BCD.to_vec(), serial).to_bytes()
    }

    fn location_bytes(serial: u16) -> Vec<u8> {
        let mut payload = vec![0x18, 0x03, 0x05, 0x0A, 0x14, 0x1E, 0xC7];
        payload.extend_from_slice(&40_594_680u32.to_be_bytes());
        payload.extend_from_slice(&205_596_000u32.to_be_bytes());
        payload.push(0x28);
        payload.extend_from_slice(&((1u16 << 12) | 120).to_be_bytes());
        Frame::standard(codec::PROTO_LOCATION, payload, serial).to_bytes()
    }

    fn heartbeat_bytes(serial: u16) -> Vec<u8> {
        Frame::standard(codec::PROTO_HEARTBEAT, vec![0x06, 0x04, 0x00, 0x01], serial).to_bytes()
    }

    async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> [u8; 10] {
        let mut buf = [0u8; 10];
        tokio::time::timeout(Duration::from_secs(2), reader.read_exact(&mut buf))
            .await
            .expect("ack not written in time")
            .expect("socket closed while awaiting ack");
        buf
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

    fn session_kinds(bus: &MemoryBus) -> Vec<(i32, String)> {
        bus.topic_records("device.session")
            .iter()
            .map(|r| {
                let record = DeviceSessionRecord::decode_length_delimited(r.payload.clone())
                    .expect("session record decodes");
                (record.kind, record.session_id)
            })
            .collect()
    }

    #[tokio::test]
    async fn login_then_location() {
        let (ctx, store, bus) = test_context(GatewayConfig::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let _task = tokio::spawn(run_connection(ctx.clone(), server, "10.0.0.9:4242".into()));

        client.write_all(&login_bytes(1)).await.unwrap();
        let ack = read_ack(&mut client).await;
        assert_eq!(&ack[..6], &[0x78, 0x78, 0x05, 0x01, 0x00, 0x01]);

        wait_for(|| !bus.topic_records("device.session").is_empty()).await;
        let sessions = bus.topic_records("device.session");
        assert_eq!(sessions[0].key, IMEI_STR);
        let record =
            DeviceSessionRecord::decode_length_delimited(sessions[0].payload.clone()).unwrap();
        assert_eq!(record.kind, SessionKind::SessionConnected as i32);
        assert_eq!(record.imei, IMEI_STR);

        let session = store
            .get_by_imei(&Imei::new(IMEI_STR).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(session.authenticated);

        client.write_all(&location_bytes(2)).await.unwrap();
        let ack = read_ack(&mut client).await;
        assert_eq!(ack[3], codec::PROTO_LOCATION);
        assert_eq!(&ack[4..6], &[0x00, 0x02]);

        wait_for(|| {
            bus.topic_records("device.telemetry")
                .iter()
                .any(|r| {
                    TelemetryRecord::decode_length_delimited(r.payload.clone())
                        .map(|t| t.message_kind == "location")
                        .unwrap_or(false)
                })
        })
        .await;
        let telemetry = bus.topic_records("device.telemetry");
        let location = telemetry
            .iter()
            .filter_map(|r| TelemetryRecord::decode_length_delimited(r.payload.clone()).ok())
            .find(|t| t.message_kind == "location")
            .unwrap();
        assert_eq!(location.imei, IMEI_STR);
        let fix = location.location.unwrap();
        assert!(fix.valid);
        assert_eq!(fix.speed_kmh, 40);
        wait_for(|| bus.topic_records("device.location").len() == 1).await;

        // The session's last position tracked the fix.
        let session = store
            .get_by_imei(&Imei::new(IMEI_STR).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(session.last_position.is_some());
    }

    #[tokio::test]
    async fn fragmented_login_produces_one_ack_and_one_event() {
        let (ctx, _store, bus) = test_context(GatewayConfig::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let _task = tokio::spawn(run_connection(ctx, server, "10.0.0.9:4242".into()));

        for byte in login_bytes(1) {
            client.write_all(&[byte]).await.unwrap();
            client.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let ack = read_ack(&mut client).await;
        assert_eq!(ack[3], codec::PROTO_LOGIN);

        wait_for(|| !bus.topic_records("device.session").is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.topic_records("device.session").len(), 1);

        // No second ack materialises.
        let mut extra = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), client.read(&mut extra)).await;
        assert!(read.is_err(), "unexpected extra bytes after single ack");
    }

    #[tokio::test]
    async fn pre_login_frame_closes_without_session_or_events() {
        let (ctx, store, bus) = test_context(GatewayConfig::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let _task = tokio::spawn(run_connection(ctx, server, "10.0.0.9:4242".into()));

        client.write_all(&heartbeat_bytes(1)).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("connection should close")
            .unwrap();
        assert_eq!(n, 0, "expected EOF, got {} bytes", n);

        assert_eq!(store.active_count().await.unwrap(), 0);
        assert!(bus.records().is_empty());
    }

    #[tokio::test]
    async fn replacement_login_orders_events() {
        let (ctx, store, bus) = test_context(GatewayConfig::default());

        let (mut client1, server1) = tokio::io::duplex(4096);
        let _task1 = tokio::spawn(run_connection(ctx.clone(), server1, "10.0.0.1:1000".into()));
        client1.write_all(&login_bytes(1)).await.unwrap();
        read_ack(&mut client1).await;
        wait_for(|| bus.topic_records("device.session").len() == 1).await;

        let (mut client2, server2) = tokio::io::duplex(4096);
        let _task2 = tokio::spawn(run_connection(ctx.clone(), server2, "10.0.0.2:1000".into()));
        client2.write_all(&login_bytes(1)).await.unwrap();
        read_ack(&mut client2).await;

        // The first socket is closed by the replacement.
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client1.read(&mut buf))
            .await
            .expect("displaced connection should close")
            .unwrap();
        assert_eq!(n, 0);

        wait_for(|| bus.topic_records("device.session").len() == 3).await;
        let kinds = session_kinds(&bus);
        assert_eq!(kinds[0].0, SessionKind::SessionConnected as i32);
        assert_eq!(kinds[1].0, SessionKind::SessionDisconnected as i32);
        assert_eq!(kinds[2].0, SessionKind::SessionConnected as i32);
        // The Disconnected names the first session; the final Connected
        // names a fresh one.
        assert_eq!(kinds[1].1, kinds[0].1);
        assert_ne!(kinds[2].1, kinds[0].1);

        // Exactly one authenticated session survives.
        assert_eq!(store.active_count().await.unwrap(), 1);
        let session = store
            .get_by_imei(&Imei::new(IMEI_STR).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kinds[2].1, session.id);
    }

    #[tokio::test]
    async fn crc_mismatch_is_answered_but_not_fatal() {
        let (ctx, _store, bus) = test_context(GatewayConfig::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let _task = tokio::spawn(run_connection(ctx, server, "10.0.0.9:4242".into()));

        let mut corrupt = login_bytes(1);
        corrupt[5] ^= 0xFF;
        client.write_all(&corrupt).await.unwrap();
        let ack = read_ack(&mut client).await;
        assert_eq!(ack[3], codec::PROTO_LOGIN);

        // Nothing was published and no session exists, but the
        // connection still accepts a clean login.
        assert!(bus.records().is_empty());
        client.write_all(&login_bytes(2)).await.unwrap();
        let ack = read_ack(&mut client).await;
        assert_eq!(&ack[4..6], &[0x00, 0x02]);
        wait_for(|| bus.topic_records("device.session").len() == 1).await;
    }

    #[tokio::test]
    async fn repeated_decode_failures_close_the_connection() {
        let mut config = GatewayConfig::default();
        config.decoder.failure_limit = 3;
        let (ctx, _store, _bus) = test_context(config);
        let (mut client, server) = tokio::io::duplex(4096);
        let _task = tokio::spawn(run_connection(ctx, server, "10.0.0.9:4242".into()));

        client.write_all(&login_bytes(1)).await.unwrap();
        read_ack(&mut client).await;

        // Truncated payloads and unsupported protocol numbers share one
        // failure window: each draws an ack, the third closes.
        let bad_frames = [
            Frame::standard(codec::PROTO_STATUS, vec![0x00], 2),
            Frame::standard(0x77, vec![0x01, 0x02], 3),
            Frame::standard(codec::PROTO_STATUS, vec![0x00], 4),
        ];
        for bad in &bad_frames {
            client.write_all(&bad.to_bytes()).await.unwrap();
            read_ack(&mut client).await;
        }
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("connection should close after repeated failures")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn unauthenticated_connection_times_out() {
        let mut config = GatewayConfig::default();
        config.session.unauth_timeout_s = 1;
        let (ctx, store, _bus) = test_context(config);
        let (mut client, server) = tokio::io::duplex(4096);
        let _task = tokio::spawn(run_connection(ctx, server, "10.0.0.9:4242".into()));

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("connection should time out without login")
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(store.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn command_is_written_to_the_socket() {
        let (ctx, store, _bus) = test_context(GatewayConfig::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let _task = tokio::spawn(run_connection(ctx.clone(), server, "10.0.0.9:4242".into()));

        client.write_all(&login_bytes(1)).await.unwrap();
        read_ack(&mut client).await;
        wait_for_session(&store).await;

        let session = store
            .get_by_imei(&Imei::new(IMEI_STR).unwrap())
            .await
            .unwrap()
            .unwrap();
        let handle = ctx.channels.get(session.channel_id).unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        handle
            .commands
            .send(OutboundCommand {
                event: CommandEvent {
                    command_id: "cmd-1".into(),
                    imei: Imei::new(IMEI_STR).unwrap(),
                    command_text: "DYD,000000#".into(),
                    parameters: HashMap::new(),
                    priority: crate::events::CommandPriority::High,
                    retry_count: 0,
                    max_retries: 3,
                    at: Utc::now(),
                },
                done: done_tx,
            })
            .await
            .unwrap();
        assert!(done_rx.await.unwrap());

        // start (2) + length field (1) + protocol (1) + body-length byte (1)
        let mut header = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut header))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&header[0..2], &[0x78, 0x78]);
        assert_eq!(header[3], codec::PROTO_COMMAND);
        let declared = usize::from(header[2]);
        let mut rest = vec![0u8; declared];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut rest))
            .await
            .unwrap()
            .unwrap();
        // rest: server flag (4), text, language (2), serial, crc, stop
        assert_eq!(&rest[4..15], b"DYD,000000#");
    }

    async fn wait_for_session(store: &MemoryStore) {
        for _ in 0..200 {
            if store
                .get_by_imei(&Imei::new(IMEI_STR).unwrap())
                .await
                .unwrap()
                .is_some()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never appeared");
    }
}
