//! In-process broker with a single partition per topic.
//!
//! Every handle cloned from one [`MemoryBroker`] sees the same topic logs and
//! committed group offsets. Producers own a bounded outbound queue drained by
//! a background delivery task, so backpressure behaves like a real client:
//! [`MemoryBroker::pause_delivery`] stalls the drain and lets the queue fill.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::broker::{
    BrokerConnector, BrokerConsumer, BrokerProducer, DeliveryCallback, DeliveryReport,
    ReceivedMessage,
};
use crate::config::{DispatcherConfig, OffsetReset, PublisherConfig};
use crate::error::{BridgeError, Result};
use crate::types::{Offset, TopicName};

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    address: String,
    reachable: AtomicBool,
    state: Mutex<BrokerState>,
    /// Bumped on every append so polling consumers can wait for new entries.
    appended: watch::Sender<u64>,
    delivery_open: watch::Sender<bool>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<TopicName, Vec<LogEntry>>,
    committed: HashMap<(String, TopicName), Offset>,
}

#[derive(Debug, Clone)]
enum LogEntry {
    Record {
        payload: Bytes,
        timestamp: DateTime<Utc>,
    },
    /// Surfaces as a broker-reported error to whichever consumer reaches it.
    Error(String),
}

impl MemoryBroker {
    pub fn new<S: Into<String>>(address: S) -> Self {
        let (appended, _) = watch::channel(0);
        let (delivery_open, _) = watch::channel(true);

        Self {
            inner: Arc::new(BrokerInner {
                address: address.into(),
                reachable: AtomicBool::new(true),
                state: Mutex::new(BrokerState::default()),
                appended,
                delivery_open,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// An unreachable broker refuses new connections, fails deliveries and
    /// reports an error on every poll.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Stop draining producer queues; queued messages stay in flight.
    pub fn pause_delivery(&self) {
        self.inner.delivery_open.send_replace(false);
    }

    pub fn resume_delivery(&self) {
        self.inner.delivery_open.send_replace(true);
    }

    /// Append a broker error entry that consumers will observe in log order.
    pub fn inject_error<S: Into<String>>(&self, topic: &str, error: S) -> Offset {
        self.append(topic, LogEntry::Error(error.into()))
    }

    /// Append an arbitrary payload, bypassing any producer.
    pub fn append_raw<B: Into<Bytes>>(&self, topic: &str, payload: B) -> Offset {
        self.append(
            topic,
            LogEntry::Record {
                payload: payload.into(),
                timestamp: Utc::now(),
            },
        )
    }

    /// Payloads stored in `topic`, in log order, excluding error entries.
    pub fn records(&self, topic: &str) -> Vec<Bytes> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .map(|log| {
                log.iter()
                    .filter_map(|entry| match entry {
                        LogEntry::Record { payload, .. } => Some(payload.clone()),
                        LogEntry::Error(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Next offset `group` will read from `topic`, if it has committed one.
    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<Offset> {
        let state = self.inner.state.lock();
        state
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    fn append(&self, topic: &str, entry: LogEntry) -> Offset {
        let offset = {
            let mut state = self.inner.state.lock();
            let log = state.topics.entry(topic.to_string()).or_default();
            log.push(entry);
            (log.len() - 1) as Offset
        };
        self.inner.appended.send_modify(|seq| *seq += 1);
        offset
    }

    fn check_reachable(&self, address: &str) -> Result<()> {
        let listed = address
            .split(',')
            .any(|entry| entry.trim() == self.inner.address);

        if !listed || !self.is_reachable() {
            return Err(BridgeError::Connection(format!(
                "broker unreachable at {}",
                address
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("address", &self.inner.address)
            .field("reachable", &self.is_reachable())
            .finish()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    type Producer = MemoryProducer;
    type Consumer = MemoryConsumer;

    async fn connect_producer(&self, config: &PublisherConfig) -> Result<MemoryProducer> {
        self.check_reachable(&config.address)?;

        let capacity = u32::try_from(config.queue_capacity).map_err(|_| {
            BridgeError::InvalidConfig("publisher.queue_capacity is too large".to_string())
        })?;

        let (queue, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_delivery(self.clone(), receiver));

        debug!(address = %config.address, capacity, "Opened in-memory producer");
        Ok(MemoryProducer {
            capacity,
            slots: Arc::new(Semaphore::new(capacity as usize)),
            queue,
        })
    }

    async fn connect_consumer(
        &self,
        config: &DispatcherConfig,
        topics: &[&str],
    ) -> Result<MemoryConsumer> {
        self.check_reachable(&config.address)?;

        let positions = {
            let state = self.inner.state.lock();
            topics
                .iter()
                .map(|topic| {
                    let key = (config.group_id.clone(), topic.to_string());
                    let start = match state.committed.get(&key) {
                        Some(offset) => *offset,
                        None => match config.offset_reset {
                            OffsetReset::Earliest => 0,
                            OffsetReset::Latest => {
                                state.topics.get(*topic).map_or(0, |log| log.len() as Offset)
                            }
                        },
                    };
                    (topic.to_string(), start)
                })
                .collect()
        };

        info!(
            address = %config.address,
            group_id = %config.group_id,
            ?topics,
            "Opened in-memory consumer"
        );

        Ok(MemoryConsumer {
            broker: self.clone(),
            group_id: config.group_id.clone(),
            positions,
            appended: self.inner.appended.subscribe(),
            closed: false,
        })
    }
}

/// Message waiting in a producer's outbound queue. Holds its queue slot.
struct Pending {
    topic: TopicName,
    payload: Bytes,
    on_delivery: DeliveryCallback,
    _slot: OwnedSemaphorePermit,
}

/// Drains one producer's queue in FIFO order.
async fn run_delivery(broker: MemoryBroker, mut receiver: mpsc::UnboundedReceiver<Pending>) {
    let mut open = broker.inner.delivery_open.subscribe();

    while let Some(pending) = receiver.recv().await {
        if open.wait_for(|open| *open).await.is_err() {
            break;
        }

        let report = if broker.is_reachable() {
            let offset = broker.append(
                &pending.topic,
                LogEntry::Record {
                    payload: pending.payload.clone(),
                    timestamp: Utc::now(),
                },
            );
            DeliveryReport::delivered(&pending.topic, 0, offset)
        } else {
            DeliveryReport::failed(&pending.topic, "broker unreachable")
        };

        (pending.on_delivery)(report);
        // The slot is released only after the callback has run.
        drop(pending);
    }
}

pub struct MemoryProducer {
    capacity: u32,
    slots: Arc<Semaphore>,
    queue: mpsc::UnboundedSender<Pending>,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    fn produce(&self, topic: &str, payload: Bytes, on_delivery: DeliveryCallback) -> Result<()> {
        let slot = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| BridgeError::QueueFull)?;

        self.queue
            .send(Pending {
                topic: topic.to_string(),
                payload,
                on_delivery,
                _slot: slot,
            })
            .map_err(|_| BridgeError::Publish("delivery task has stopped".to_string()))
    }

    async fn wait_for_capacity(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.slots.acquire()).await,
            Ok(Ok(_))
        )
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.slots.acquire_many(self.capacity)).await {
            Ok(Ok(_all)) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::IllegalState(
                "producer queue is closed".to_string(),
            )),
            Err(_) => Err(BridgeError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn in_flight(&self) -> usize {
        self.capacity as usize - self.slots.available_permits()
    }
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: String,
    positions: Vec<(TopicName, Offset)>,
    appended: watch::Receiver<u64>,
    closed: bool,
}

impl MemoryConsumer {
    /// Take the next entry from the first subscribed topic that has one and
    /// commit the new position for the group.
    fn next_entry(&mut self) -> Option<Result<ReceivedMessage>> {
        let mut state = self.broker.inner.state.lock();

        for (topic, position) in self.positions.iter_mut() {
            let Some(entry) = state
                .topics
                .get(topic.as_str())
                .and_then(|log| log.get(*position as usize))
                .cloned()
            else {
                continue;
            };

            let offset = *position;
            *position += 1;
            state
                .committed
                .insert((self.group_id.clone(), topic.clone()), *position);

            return Some(match entry {
                LogEntry::Record { payload, timestamp } => Ok(ReceivedMessage {
                    topic: topic.clone(),
                    partition: 0,
                    offset,
                    payload,
                    timestamp,
                }),
                LogEntry::Error(error) => Err(BridgeError::BrokerReported(error)),
            });
        }

        None
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> Option<Result<ReceivedMessage>> {
        if self.closed {
            return Some(Err(BridgeError::IllegalState(
                "consumer is closed".to_string(),
            )));
        }

        if !self.broker.is_reachable() {
            tokio::time::sleep(timeout).await;
            return Some(Err(BridgeError::BrokerReported(format!(
                "{}: broker transport failure",
                self.broker.address()
            ))));
        }

        let deadline = Instant::now() + timeout;
        loop {
            // Mark the current log version as seen before looking, so an
            // append racing with the lookup still wakes `changed()`.
            self.appended.borrow_and_update();

            if let Some(entry) = self.next_entry() {
                return Some(entry);
            }

            match tokio::time::timeout_at(deadline, self.appended.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(BridgeError::IllegalState(
                "consumer already closed".to_string(),
            ));
        }
        self.closed = true;
        debug!(group_id = %self.group_id, "Closed in-memory consumer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const TOPIC: &str = "test-topic";

    fn publisher_config(capacity: usize) -> PublisherConfig {
        PublisherConfig {
            queue_capacity: capacity,
            ..PublisherConfig::with_address("localhost:9092")
        }
    }

    fn counting_callback(counter: Arc<AtomicUsize>) -> DeliveryCallback {
        Arc::new(move |report: DeliveryReport| {
            if report.is_success() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_connect_checks_address_and_reachability() {
        let broker = MemoryBroker::new("localhost:9092");

        let err = broker
            .connect_producer(&PublisherConfig::with_address("otherhost:9092"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Connection(_)));

        broker.set_reachable(false);
        let err = broker
            .connect_consumer(&DispatcherConfig::with_address("localhost:9092"), &[TOPIC])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Connection(_)));

        broker.set_reachable(true);
        assert!(broker
            .connect_producer(&PublisherConfig::with_address("a:1, localhost:9092"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_delivery_appends_in_order_and_reports() {
        let broker = MemoryBroker::new("localhost:9092");
        let producer = broker.connect_producer(&publisher_config(16)).await.unwrap();
        let delivered = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            producer
                .produce(TOPIC, Bytes::from(format!("m{}", i)), counting_callback(delivered.clone()))
                .unwrap();
        }
        producer.flush(Duration::from_secs(1)).await.unwrap();

        assert_eq!(delivered.load(Ordering::SeqCst), 5);
        assert_eq!(producer.in_flight(), 0);
        let records: Vec<_> = broker.records(TOPIC).into_iter().map(|b| b.to_vec()).collect();
        assert_eq!(records, vec![b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec(), b"m4".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_while_paused() {
        let broker = MemoryBroker::new("localhost:9092");
        let producer = broker.connect_producer(&publisher_config(2)).await.unwrap();
        let delivered = Arc::new(AtomicUsize::new(0));

        broker.pause_delivery();
        producer.produce(TOPIC, Bytes::from_static(b"a"), counting_callback(delivered.clone())).unwrap();
        producer.produce(TOPIC, Bytes::from_static(b"b"), counting_callback(delivered.clone())).unwrap();

        let err = producer
            .produce(TOPIC, Bytes::from_static(b"c"), counting_callback(delivered.clone()))
            .unwrap_err();
        assert_eq!(err, BridgeError::QueueFull);
        assert_eq!(producer.in_flight(), 2);
        assert!(!producer.wait_for_capacity(Duration::from_secs(5)).await);
        assert!(matches!(
            producer.flush(Duration::from_secs(1)).await,
            Err(BridgeError::Timeout { timeout_ms: 1000 })
        ));

        broker.resume_delivery();
        assert!(producer.wait_for_capacity(Duration::from_secs(5)).await);
        producer.flush(Duration::from_secs(1)).await.unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_deliveries() {
        let broker = MemoryBroker::new("localhost:9092");
        let producer = broker.connect_producer(&publisher_config(4)).await.unwrap();
        let failures = Arc::new(Mutex::new(Vec::new()));

        broker.set_reachable(false);
        let sink = failures.clone();
        producer
            .produce(
                TOPIC,
                Bytes::from_static(b"lost"),
                Arc::new(move |report: DeliveryReport| sink.lock().push(report)),
            )
            .unwrap();
        producer.flush(Duration::from_secs(1)).await.unwrap();

        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.as_deref(), Some("broker unreachable"));
        assert!(broker.records(TOPIC).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_offset_reset_and_commit() {
        let broker = MemoryBroker::new("localhost:9092");
        broker.append_raw(TOPIC, "old");

        let latest = DispatcherConfig::with_address("localhost:9092");
        let mut tail = broker.connect_consumer(&latest, &[TOPIC]).await.unwrap();
        assert!(tail.poll(Duration::from_secs(1)).await.is_none());

        let earliest = DispatcherConfig {
            group_id: "replay".to_string(),
            offset_reset: OffsetReset::Earliest,
            ..DispatcherConfig::with_address("localhost:9092")
        };
        let mut replay = broker.connect_consumer(&earliest, &[TOPIC]).await.unwrap();
        let first = replay.poll(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"old");
        assert_eq!(first.offset, 0);
        assert_eq!(broker.committed_offset("replay", TOPIC), Some(1));

        broker.append_raw(TOPIC, "new");
        let next = tail.poll(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(&next.payload[..], b"new");

        // A fresh consumer in the same group resumes after the committed offset.
        let mut resumed = broker.connect_consumer(&earliest, &[TOPIC]).await.unwrap();
        let resumed_msg = resumed.poll(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(&resumed_msg.payload[..], b"new");
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let broker = MemoryBroker::new("localhost:9092");
        let config = DispatcherConfig::with_address("localhost:9092");
        let mut consumer = broker.connect_consumer(&config, &[TOPIC]).await.unwrap();

        let writer = broker.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append_raw(TOPIC, "late");
        });

        let msg = consumer.poll(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(&msg.payload[..], b"late");
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_entries_and_close() {
        let broker = MemoryBroker::new("localhost:9092");
        let config = DispatcherConfig::with_address("localhost:9092");
        let mut consumer = broker.connect_consumer(&config, &[TOPIC]).await.unwrap();

        broker.inject_error(TOPIC, "leader not available");
        let polled = consumer.poll(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            polled.unwrap_err(),
            BridgeError::BrokerReported("leader not available".to_string())
        );

        consumer.close().unwrap();
        assert!(matches!(consumer.close(), Err(BridgeError::IllegalState(_))));
        assert!(matches!(
            consumer.poll(Duration::from_secs(1)).await,
            Some(Err(BridgeError::IllegalState(_)))
        ));
    }
}
