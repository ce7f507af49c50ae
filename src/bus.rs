//! Event bus and command source seams.
//!
//! The bus is external infrastructure; the gateway reaches it through
//! these narrow interfaces. [`MemoryBus`] and [`MemoryCommandQueue`]
//! implement them in-process for tests and single-node deployments; a
//! partitioned log client implements them in production. Partitioning
//! by IMEI (the record key) is what preserves per-device order
//! downstream, so implementations must key on [`BusRecord::key`].

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::events::{CommandEvent, CommandPriority};
use crate::imei::Imei;

/// Errors publishing to or requeueing on the bus.
#[derive(Debug)]
pub enum BusError {
    /// The publish did not complete within its deadline.
    Timeout,
    /// The bus endpoint could not be reached.
    Unavailable(String),
    /// The destination topic does not exist.
    TopicMissing(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BusError::Timeout => write!(f, "bus publish timed out"),
            BusError::Unavailable(e) => write!(f, "bus unavailable: {}", e),
            BusError::TopicMissing(t) => write!(f, "bus topic missing: {}", t),
        }
    }
}

impl std::error::Error for BusError {}

/// One record bound for a topic, keyed for partitioning.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    pub topic: String,
    pub key: String,
    pub payload: Bytes,
}

/// Producer side of the partitioned log.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, record: BusRecord) -> Result<(), BusError>;
}

/// Consumer side for the `device.command` topic.
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// The next command for this instance; waits until one is
    /// available. `None` means the source has shut down.
    async fn next(&self) -> Option<CommandEvent>;

    /// Acknowledge a delivered command.
    async fn ack(&self, command_id: &str);

    /// Hand an undelivered command back for redelivery.
    async fn requeue(&self, event: CommandEvent) -> Result<(), BusError>;
}

/// In-process [`EventBus`] that records everything it is given. The
/// availability toggle simulates an outage.
#[derive(Default)]
pub struct MemoryBus {
    records: Mutex<Vec<BusRecord>>,
    unavailable: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Everything published so far, in publish order.
    pub fn records(&self) -> Vec<BusRecord> {
        self.lock().clone()
    }

    /// Records published to one topic, in publish order.
    pub fn topic_records(&self, topic: &str) -> Vec<BusRecord> {
        self.lock()
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<BusRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, record: BusRecord) -> Result<(), BusError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("simulated outage".into()));
        }
        self.lock().push(record);
        Ok(())
    }
}

#[derive(Debug)]
struct QueuedCommand {
    priority: CommandPriority,
    seq: u64,
    event: CommandEvent,
}

impl PartialEq for QueuedCommand {
    fn eq(&self, other: &QueuedCommand) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedCommand {}

impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &QueuedCommand) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedCommand {
    fn cmp(&self, other: &QueuedCommand) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct CommandQueueInner {
    queues: HashMap<Imei, BinaryHeap<QueuedCommand>>,
    /// Round-robin order across devices; priority never crosses IMEIs.
    rotation: VecDeque<Imei>,
    acked: Vec<String>,
    closed: bool,
}

/// In-process [`CommandSource`] with per-IMEI priority ordering.
#[derive(Default)]
pub struct MemoryCommandQueue {
    inner: Mutex<CommandQueueInner>,
    notify: Notify,
    seq: AtomicU64,
}

impl MemoryCommandQueue {
    pub fn new() -> MemoryCommandQueue {
        MemoryCommandQueue::default()
    }

    /// Submit a command, ahead of queued lower-priority commands for the
    /// same device.
    pub fn push(&self, event: CommandEvent) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let imei = event.imei.clone();
            let heap = inner.queues.entry(imei.clone()).or_default();
            if heap.is_empty() {
                inner.rotation.push_back(imei);
            }
            heap.push(QueuedCommand {
                priority: event.priority,
                seq,
                event,
            });
        }
        // notify_one stores a permit, so a push racing the consumer's
        // empty check is never lost.
        self.notify.notify_one();
    }

    /// Stop the queue; pending `next` calls return `None` once drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Command ids acknowledged so far.
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    pub fn pending(&self) -> usize {
        self.lock().queues.values().map(BinaryHeap::len).sum()
    }

    fn try_pop(&self) -> Option<CommandEvent> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        while let Some(imei) = inner.rotation.pop_front() {
            let Some(heap) = inner.queues.get_mut(&imei) else {
                continue;
            };
            let Some(queued) = heap.pop() else {
                inner.queues.remove(&imei);
                continue;
            };
            if heap.is_empty() {
                inner.queues.remove(&imei);
            } else {
                inner.rotation.push_back(imei);
            }
            return Some(queued.event);
        }
        None
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CommandQueueInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl CommandSource for MemoryCommandQueue {
    async fn next(&self) -> Option<CommandEvent> {
        loop {
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    async fn ack(&self, command_id: &str) {
        self.lock().acked.push(command_id.to_owned());
    }

    async fn requeue(&self, event: CommandEvent) -> Result<(), BusError> {
        self.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;

    fn command(id: &str, imei: &str, priority: CommandPriority) -> CommandEvent {
        CommandEvent {
            command_id: id.to_owned(),
            imei: Imei::new(imei).unwrap(),
            command_text: "DYD,000000#".to_owned(),
            parameters: StdHashMap::new(),
            priority,
            retry_count: 0,
            max_retries: 3,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn priority_jumps_within_one_imei() {
        let queue = MemoryCommandQueue::new();
        queue.push(command("a", "111111111111111", CommandPriority::Normal));
        queue.push(command("b", "111111111111111", CommandPriority::Normal));
        queue.push(command("c", "111111111111111", CommandPriority::Critical));

        assert_eq!(queue.next().await.unwrap().command_id, "c");
        assert_eq!(queue.next().await.unwrap().command_id, "a");
        assert_eq!(queue.next().await.unwrap().command_id, "b");
    }

    #[tokio::test]
    async fn priority_does_not_cross_imeis() {
        let queue = MemoryCommandQueue::new();
        queue.push(command("a", "111111111111111", CommandPriority::Low));
        queue.push(command("b", "222222222222222", CommandPriority::Critical));

        // Device 1 entered the rotation first; device 2's priority does
        // not displace it.
        assert_eq!(queue.next().await.unwrap().command_id, "a");
        assert_eq!(queue.next().await.unwrap().command_id, "b");
    }

    #[tokio::test]
    async fn next_waits_for_push() {
        let queue = std::sync::Arc::new(MemoryCommandQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(command("late", "111111111111111", CommandPriority::Normal));
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.command_id, "late");
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = MemoryCommandQueue::new();
        queue.push(command("a", "111111111111111", CommandPriority::Normal));
        queue.close();
        assert!(queue.next().await.is_some());
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn outage_toggle() {
        let bus = MemoryBus::new();
        let record = BusRecord {
            topic: "t".into(),
            key: "k".into(),
            payload: Bytes::from_static(b"x"),
        };
        bus.set_available(false);
        assert!(bus.publish(record.clone()).await.is_err());
        bus.set_available(true);
        bus.publish(record).await.unwrap();
        assert_eq!(bus.records().len(), 1);
    }
}
