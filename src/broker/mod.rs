//! Broker client capabilities the bridge is written against.
//!
//! The bridge owns exactly one producer or consumer handle per endpoint and
//! never shares it. Backends: [`memory`] (in-process) and, with the `kafka`
//! feature, [`kafka`].

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DispatcherConfig, PublisherConfig};
use crate::error::Result;
use crate::types::{Offset, PartitionId, TopicName};

pub use memory::{MemoryBroker, MemoryConsumer, MemoryProducer};

#[cfg(feature = "kafka")]
pub use kafka::{KafkaConnector, KafkaConsumer, KafkaProducer};

/// Completion handler run by the broker client once a message is delivered
/// or has permanently failed. Runs on the client's own delivery task.
pub type DeliveryCallback = Arc<dyn Fn(DeliveryReport) + Send + Sync>;

/// Outcome of one produced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Option<Offset>,
    pub error: Option<String>,
}

impl DeliveryReport {
    pub fn delivered(topic: &str, partition: PartitionId, offset: Offset) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset: Some(offset),
            error: None,
        }
    }

    pub fn failed(topic: &str, error: impl Into<String>) -> Self {
        Self {
            topic: topic.to_string(),
            partition: -1,
            offset: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A message returned by a consumer poll.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// Opens broker handles for a given endpoint configuration.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    type Producer: BrokerProducer;
    type Consumer: BrokerConsumer;

    /// Fails with `BridgeError::Connection` if the broker cannot be reached.
    async fn connect_producer(&self, config: &PublisherConfig) -> Result<Self::Producer>;

    /// Opens a consumer in `config.group_id` subscribed to `topics`.
    async fn connect_consumer(
        &self,
        config: &DispatcherConfig,
        topics: &[&str],
    ) -> Result<Self::Consumer>;
}

/// Asynchronous, queue-backed producer.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Enqueue `payload` for delivery without waiting for it.
    ///
    /// Returns `BridgeError::QueueFull` when the local queue is at capacity.
    fn produce(&self, topic: &str, payload: Bytes, on_delivery: DeliveryCallback) -> Result<()>;

    /// Wait up to `timeout` for queue space; returns whether space is available.
    async fn wait_for_capacity(&self, timeout: Duration) -> bool;

    /// Wait until every queued message is delivered or has failed.
    async fn flush(&self, timeout: Duration) -> Result<()>;

    /// Messages enqueued but not yet delivered.
    fn in_flight(&self) -> usize;
}

/// Polling consumer bound to a group and a set of topics.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// `None` when nothing arrived within `timeout`; `Some(Err(_))` carries a
    /// broker-reported error for this poll.
    async fn poll(&mut self, timeout: Duration) -> Option<Result<ReceivedMessage>>;

    /// Release the handle. Calling this twice is an error.
    fn close(&mut self) -> Result<()>;
}
