//! Kafka backend built on `rdkafka`.
//!
//! Both handles probe cluster metadata when connecting, so an unreachable
//! bootstrap address fails construction instead of the first publish or poll.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    BrokerConnector, BrokerConsumer, BrokerProducer, DeliveryCallback, DeliveryReport,
    ReceivedMessage,
};
use crate::config::{DispatcherConfig, PublisherConfig};
use crate::error::{BridgeError, Result};

const CAPACITY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Opens `rdkafka` producers and consumers.
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    client_id: String,
}

impl KafkaConnector {
    pub fn new() -> Self {
        Self {
            client_id: format!("docbridge-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_client_id<S: Into<String>>(client_id: S) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    fn base_config(&self, address: &str) -> ClientConfig {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", address);
        cfg.set("client.id", self.client_id.as_str());
        cfg
    }
}

impl Default for KafkaConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for KafkaConnector {
    type Producer = KafkaProducer;
    type Consumer = KafkaConsumer;

    async fn connect_producer(&self, config: &PublisherConfig) -> Result<KafkaProducer> {
        let mut cfg = self.base_config(&config.address);
        cfg.set(
            "queue.buffering.max.messages",
            config.queue_capacity.to_string(),
        );

        let producer: FutureProducer = cfg
            .create()
            .map_err(|e| BridgeError::Connection(format!("producer create failed: {}", e)))?;

        let probe = producer.clone();
        let timeout = config.connect_timeout();
        probe_metadata(&config.address, move || {
            probe.client().fetch_metadata(None, timeout).map(|_| ())
        })
        .await?;

        info!(address = %config.address, capacity = config.queue_capacity, "Kafka producer connected");
        Ok(KafkaProducer {
            producer,
            capacity: config.queue_capacity,
        })
    }

    async fn connect_consumer(
        &self,
        config: &DispatcherConfig,
        topics: &[&str],
    ) -> Result<KafkaConsumer> {
        let mut cfg = self.base_config(&config.address);
        cfg.set("group.id", config.group_id.as_str());
        cfg.set("auto.offset.reset", config.offset_reset.as_str());
        cfg.set("enable.auto.commit", "true");

        let consumer: StreamConsumer = cfg
            .create()
            .map_err(|e| BridgeError::Connection(format!("consumer create failed: {}", e)))?;
        let consumer = Arc::new(consumer);

        let probe = consumer.clone();
        let timeout = config.connect_timeout();
        probe_metadata(&config.address, move || {
            probe.fetch_metadata(None, timeout).map(|_| ())
        })
        .await?;

        consumer
            .subscribe(topics)
            .map_err(|e| BridgeError::Connection(format!("subscribe failed: {}", e)))?;

        info!(
            address = %config.address,
            group_id = %config.group_id,
            ?topics,
            "Kafka consumer connected"
        );
        Ok(KafkaConsumer {
            consumer: Some(consumer),
        })
    }
}

/// Run a blocking metadata request off the runtime threads.
async fn probe_metadata<F>(address: &str, probe: F) -> Result<()>
where
    F: FnOnce() -> std::result::Result<(), KafkaError> + Send + 'static,
{
    tokio::task::spawn_blocking(probe)
        .await
        .map_err(|e| BridgeError::Connection(format!("metadata probe aborted: {}", e)))?
        .map_err(|e| BridgeError::Connection(format!("broker at {} unreachable: {}", address, e)))
}

pub struct KafkaProducer {
    producer: FutureProducer,
    capacity: usize,
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    fn produce(&self, topic: &str, payload: Bytes, on_delivery: DeliveryCallback) -> Result<()> {
        let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(topic).payload(&payload[..]);

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                return Err(BridgeError::QueueFull);
            }
            Err((e, _)) => return Err(BridgeError::Publish(e.to_string())),
        };

        let topic = topic.to_string();
        tokio::spawn(async move {
            let report = match delivery.await {
                Ok(Ok((partition, offset))) => DeliveryReport::delivered(&topic, partition, offset),
                Ok(Err((e, _message))) => DeliveryReport::failed(&topic, e.to_string()),
                Err(_canceled) => DeliveryReport::failed(&topic, "delivery future cancelled"),
            };
            on_delivery(report);
        });
        Ok(())
    }

    async fn wait_for_capacity(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight() < self.capacity {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(CAPACITY_POLL_INTERVAL).await;
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        let result = tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BridgeError::Publish(format!("flush aborted: {}", e)))?;

        match result {
            Ok(()) => Ok(()),
            Err(KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut)) => {
                warn!(in_flight = self.in_flight(), "Flush timed out");
                Err(BridgeError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(e) => Err(BridgeError::Publish(e.to_string())),
        }
    }

    fn in_flight(&self) -> usize {
        self.producer.in_flight_count().max(0) as usize
    }
}

pub struct KafkaConsumer {
    consumer: Option<Arc<StreamConsumer>>,
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn poll(&mut self, timeout: Duration) -> Option<Result<ReceivedMessage>> {
        let Some(consumer) = self.consumer.as_ref() else {
            return Some(Err(BridgeError::IllegalState(
                "consumer is closed".to_string(),
            )));
        };

        let received = match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_elapsed) => return None,
            Ok(received) => received,
        };

        Some(match received {
            Ok(message) => Ok(ReceivedMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
                timestamp: message
                    .timestamp()
                    .to_millis()
                    .and_then(DateTime::from_timestamp_millis)
                    .unwrap_or_else(Utc::now),
            }),
            Err(e) => Err(BridgeError::BrokerReported(e.to_string())),
        })
    }

    fn close(&mut self) -> Result<()> {
        match self.consumer.take() {
            Some(consumer) => {
                consumer.unsubscribe();
                debug!("Kafka consumer closed");
                Ok(())
            }
            None => Err(BridgeError::IllegalState(
                "consumer already closed".to_string(),
            )),
        }
    }
}
