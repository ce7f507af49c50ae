//! Telemetry publisher.
//!
//! Producers hand events to a bounded queue; a single pump task
//! serialises them and ships them to the bus, so connection tasks never
//! await the network. Session events are never shed (the producer waits
//! for queue space); telemetry is load-shed newest-first when the queue
//! is full, with a drop counter. A failed publish is retried with
//! bounded exponential backoff and then dropped: a sick bus degrades to
//! event loss, never to blocked ingest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{BusRecord, EventBus};
use crate::config::{PublishConfig, TopicsConfig};
use crate::events::{CommandFailure, SessionEvent, TelemetryEvent};
use crate::records;

/// One queued publication.
#[derive(Debug)]
enum Event {
    Session(SessionEvent),
    Telemetry(TelemetryEvent),
    CommandFailed(CommandFailure),
}

/// Producer handle; cheap to clone, one per connection task.
#[derive(Clone)]
pub struct TelemetryPublisher {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryPublisher {
    /// Start the pump task and return the producer handle.
    pub fn spawn(
        bus: Arc<dyn EventBus>,
        topics: TopicsConfig,
        config: PublishConfig,
    ) -> (TelemetryPublisher, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let pump = Pump {
            bus,
            topics,
            config,
            dropped: dropped.clone(),
        };
        let handle = tokio::spawn(pump.run(rx));
        (TelemetryPublisher { tx, dropped }, handle)
    }

    /// Queue a lifecycle event. Lifecycle events are never shed; when
    /// the queue is full this waits for space.
    pub async fn session_event(&self, event: SessionEvent) {
        if self.tx.send(Event::Session(event)).await.is_err() {
            warn!("publisher pump gone, session event lost");
        }
    }

    /// Queue a telemetry event, shedding it when the queue is full.
    pub fn telemetry_event(&self, event: TelemetryEvent) {
        self.shed_send(Event::Telemetry(event));
    }

    /// Queue a command failure record, shedding it when the queue is full.
    pub fn command_failed(&self, failure: CommandFailure) {
        self.shed_send(Event::CommandFailed(failure));
    }

    /// Events dropped so far, by shedding or by retry exhaustion.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn shed_send(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("publish queue full, shedding newest event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("publisher pump gone, event lost");
            }
        }
    }
}

struct Pump {
    bus: Arc<dyn EventBus>,
    topics: TopicsConfig,
    config: PublishConfig,
    dropped: Arc<AtomicU64>,
}

impl Pump {
    async fn run(self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Session(ev) => {
                    let record = records::DeviceSessionRecord::from(&ev);
                    self.ship(&self.topics.session, ev.imei.as_str(), records::encode(&record))
                        .await;
                }
                Event::Telemetry(ev) => {
                    let record = records::TelemetryRecord::from(&ev);
                    self.ship(
                        &self.topics.telemetry,
                        ev.imei.as_str(),
                        records::encode(&record),
                    )
                    .await;
                    if let Some(fix) = &ev.location {
                        let record = records::LocationRecord {
                            imei: ev.imei.as_str().to_owned(),
                            location: Some(records::Location::from(fix)),
                            at_ms: ev.at.timestamp_millis(),
                        };
                        self.ship(
                            &self.topics.location,
                            ev.imei.as_str(),
                            records::encode(&record),
                        )
                        .await;
                    }
                }
                Event::CommandFailed(ev) => {
                    let record = records::CommandFailedRecord::from(&ev);
                    self.ship(
                        &self.topics.telemetry,
                        ev.imei.as_str(),
                        records::encode(&record),
                    )
                    .await;
                }
            }
        }
        debug!("publisher pump stopping, queue closed");
    }

    /// Publish with bounded exponential backoff; drop and count on
    /// exhaustion.
    async fn ship(&self, topic: &str, key: &str, payload: bytes::Bytes) {
        let record = BusRecord {
            topic: topic.to_owned(),
            key: key.to_owned(),
            payload,
        };
        let mut delay = self.config.retry_base();
        for attempt in 0..=self.config.retry_max {
            match self.bus.publish(record.clone()).await {
                Ok(()) => return,
                Err(e) if attempt == self.config.retry_max => {
                    warn!(
                        "publish to {} failed after {} attempts, dropping event: {}",
                        topic,
                        attempt + 1,
                        e
                    );
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    debug!("publish to {} failed, retrying: {}", topic, e);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::events::SessionEventKind;
    use crate::imei::Imei;
    use crate::message::MessageKind;
    use chrono::Utc;
    use prost::Message as ProstMessage;
    use std::collections::HashMap;
    use std::time::Duration;

    fn imei() -> Imei {
        Imei::new("123456789012345").unwrap()
    }

    fn telemetry(kind: MessageKind) -> TelemetryEvent {
        TelemetryEvent {
            imei: imei(),
            kind,
            location: None,
            battery: None,
            gsm: None,
            attributes: HashMap::new(),
            raw_hex: "7878".into(),
            at: Utc::now(),
        }
    }

    fn session(kind: SessionEventKind) -> SessionEvent {
        SessionEvent {
            kind,
            session_id: "s1".into(),
            imei: imei(),
            remote_addr: "10.0.0.1:1".into(),
            protocol_version: None,
            at: Utc::now(),
        }
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
    async fn events_reach_their_topics_in_order() {
        let bus = Arc::new(MemoryBus::new());
        let (publisher, _pump) = TelemetryPublisher::spawn(
            bus.clone(),
            TopicsConfig::default(),
            PublishConfig::default(),
        );

        publisher.session_event(session(SessionEventKind::Connected)).await;
        publisher.telemetry_event(telemetry(MessageKind::Heartbeat));
        publisher.telemetry_event(telemetry(MessageKind::Status));

        wait_for(|| bus.records().len() == 3).await;
        let records = bus.records();
        assert_eq!(records[0].topic, "device.session");
        assert_eq!(records[1].topic, "device.telemetry");
        assert_eq!(records[2].topic, "device.telemetry");
        assert!(records.iter().all(|r| r.key == "123456789012345"));
    }

    #[tokio::test]
    async fn location_fix_is_mirrored_to_location_topic() {
        let bus = Arc::new(MemoryBus::new());
        let (publisher, _pump) = TelemetryPublisher::spawn(
            bus.clone(),
            TopicsConfig::default(),
            PublishConfig::default(),
        );

        let mut event = telemetry(MessageKind::Location);
        event.location = Some(crate::message::LocationFix {
            device_time: Utc::now(),
            latitude: 22.5526,
            longitude: 114.22,
            speed_kmh: 40,
            course: 120,
            satellites: 7,
            gps_valid: true,
            west: false,
            south: false,
        });
        publisher.telemetry_event(event);

        wait_for(|| bus.records().len() == 2).await;
        assert_eq!(bus.topic_records("device.telemetry").len(), 1);
        assert_eq!(bus.topic_records("device.location").len(), 1);
    }

    #[tokio::test]
    async fn outage_buffers_then_recovers_in_order() {
        let bus = Arc::new(MemoryBus::new());
        let config = PublishConfig {
            queue_capacity: 64,
            retry_max: 50,
            retry_base_ms: 5,
        };
        let (publisher, _pump) =
            TelemetryPublisher::spawn(bus.clone(), TopicsConfig::default(), config);

        bus.set_available(false);
        for i in 0..10 {
            let mut event = telemetry(MessageKind::Heartbeat);
            event.raw_hex = format!("{:02}", i);
            publisher.telemetry_event(event);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bus.records().is_empty());
        assert_eq!(publisher.dropped_events(), 0);

        bus.set_available(true);
        wait_for(|| bus.records().len() == 10).await;
        assert_eq!(publisher.dropped_events(), 0);

        // Recovery preserves the original submission order.
        let order: Vec<String> = bus
            .records()
            .iter()
            .map(|r| {
                crate::records::TelemetryRecord::decode_length_delimited(r.payload.clone())
                    .unwrap()
                    .raw_hex
            })
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("{:02}", i)).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn full_queue_sheds_newest_telemetry() {
        let bus = Arc::new(MemoryBus::new());
        let config = PublishConfig {
            queue_capacity: 2,
            retry_max: 1000,
            retry_base_ms: 50,
        };
        let (publisher, _pump) =
            TelemetryPublisher::spawn(bus.clone(), TopicsConfig::default(), config);

        // Stall the pump on the first event, fill the queue, overflow it.
        bus.set_available(false);
        for _ in 0..10 {
            publisher.telemetry_event(telemetry(MessageKind::Heartbeat));
        }
        wait_for(|| publisher.dropped_events() > 0).await;

        // Lifecycle events still get through once the bus heals.
        bus.set_available(true);
        publisher.session_event(session(SessionEventKind::Disconnected)).await;
        wait_for(|| !bus.topic_records("device.session").is_empty()).await;
    }

    #[tokio::test]
    async fn retry_exhaustion_drops_and_counts() {
        let bus = Arc::new(MemoryBus::new());
        let config = PublishConfig {
            queue_capacity: 8,
            retry_max: 2,
            retry_base_ms: 1,
        };
        let (publisher, _pump) =
            TelemetryPublisher::spawn(bus.clone(), TopicsConfig::default(), config);

        bus.set_available(false);
        publisher.telemetry_event(telemetry(MessageKind::Heartbeat));
        wait_for(|| publisher.dropped_events() == 1).await;
        bus.set_available(true);
        publisher.telemetry_event(telemetry(MessageKind::Status));
        wait_for(|| bus.records().len() == 1).await;
    }
}
