use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConnector, BrokerProducer, DeliveryCallback, DeliveryReport};
use crate::codec::{JsonCodec, Serializer};
use crate::config::PublisherConfig;
use crate::error::{BridgeError, Result};
use crate::metrics::PublisherMetrics;
use crate::types::{Document, DocumentName, DOCUMENT_TOPIC};

/// Something the document engine can emit into.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn emit(&self, name: DocumentName, document: Document) -> Result<()>;
}

/// Serializes emitted documents and submits them to the broker topic.
///
/// `publish` returns once the broker client has accepted the message for
/// delivery; the delivery outcome is only logged and counted.
///
/// # Example
///
/// ```rust,no_run
/// use docbridge::{broker::MemoryBroker, DocumentName, Document, Publisher, PublisherConfig};
/// use serde_json::json;
///
/// # async fn run() -> docbridge::Result<()> {
/// let broker = MemoryBroker::new("localhost:9092");
/// let publisher = Publisher::connect(&broker, PublisherConfig::with_address("localhost:9092")).await?;
///
/// publisher.publish(DocumentName::Start, Document::new(json!({"uid": "abc"}))).await?;
/// publisher.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Publisher<P: BrokerProducer> {
    config: PublisherConfig,
    producer: P,
    serializer: Arc<dyn Serializer>,
    on_delivery: DeliveryCallback,
    metrics: Arc<PublisherMetrics>,
    closed: AtomicBool,
    drained: AtomicBool,
}

impl<P: BrokerProducer> Publisher<P> {
    /// Open a producer through `connector` and wrap it.
    pub async fn connect<C>(connector: &C, config: PublisherConfig) -> Result<Self>
    where
        C: BrokerConnector<Producer = P>,
    {
        config.validate()?;
        let producer = connector.connect_producer(&config).await?;
        Self::new(producer, config)
    }

    /// Wrap an already opened producer.
    pub fn new(producer: P, config: PublisherConfig) -> Result<Self> {
        config.validate()?;
        let metrics = PublisherMetrics::new()?;
        let on_delivery = delivery_handler(metrics.clone());

        info!(address = %config.address, topic = DOCUMENT_TOPIC, "Created publisher");
        Ok(Self {
            config,
            producer,
            serializer: Arc::new(JsonCodec),
            on_delivery,
            metrics,
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        })
    }

    pub fn with_serializer<S: Serializer + 'static>(mut self, serializer: S) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Serialize `document` under `name` and submit it to the topic.
    ///
    /// If the producer queue is full the call waits up to `retry.wait_ms` for
    /// space and tries again, for at most `retry.max_attempts` submissions in
    /// total. When every attempt finds the queue full the document is not
    /// sent and `BridgeError::Publish` is returned.
    pub async fn publish(&self, name: DocumentName, document: Document) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::IllegalState(
                "publisher is closed".to_string(),
            ));
        }

        let payload = self.serializer.serialize(name, &document).map_err(|e| {
            self.metrics.publish_failures.inc();
            e
        })?;
        let size = payload.len() as u64;
        let policy = &self.config.retry;
        let mut attempt = 1;

        loop {
            match self
                .producer
                .produce(DOCUMENT_TOPIC, payload.clone(), self.on_delivery.clone())
            {
                Ok(()) => {
                    self.metrics.documents_published.inc();
                    self.metrics.bytes_published.inc_by(size);
                    debug!(%name, attempt, bytes = size, "Submitted document");
                    return Ok(());
                }
                Err(BridgeError::QueueFull) if attempt < policy.max_attempts => {
                    self.metrics.backpressure_waits.inc();
                    warn!(
                        %name,
                        attempt,
                        wait_ms = policy.wait_ms,
                        in_flight = self.producer.in_flight(),
                        "Producer queue full, waiting for space"
                    );
                    self.producer.wait_for_capacity(policy.wait()).await;
                    attempt += 1;
                }
                Err(BridgeError::QueueFull) => {
                    self.metrics.publish_failures.inc();
                    error!(%name, attempts = attempt, "Producer queue still full, giving up");
                    return Err(BridgeError::Publish(format!(
                        "producer queue full after {} attempt(s) for '{}' document",
                        attempt, name
                    )));
                }
                Err(e) => {
                    self.metrics.publish_failures.inc();
                    error!(%name, error = %e, category = e.category(), "Failed to submit document");
                    return Err(e);
                }
            }
        }
    }

    /// Wait for every submitted message to be delivered or to fail.
    ///
    /// New publishes are refused from the first call on. A call whose flush
    /// fails leaves the publisher undrained, so the next call flushes again;
    /// once a flush succeeds, later calls return `Ok(())` immediately.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if self.drained.load(Ordering::Acquire) {
            return Ok(());
        }

        let in_flight = self.producer.in_flight();
        self.producer
            .flush(self.config.flush_timeout())
            .await
            .map_err(|e| {
                warn!(error = %e, in_flight, "Failed to flush publisher on close");
                e
            })?;

        self.drained.store(true, Ordering::Release);
        info!(address = %self.config.address, "Publisher closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<PublisherMetrics> {
        self.metrics.clone()
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }
}

#[async_trait]
impl<P: BrokerProducer> DocumentSink for Publisher<P> {
    async fn emit(&self, name: DocumentName, document: Document) -> Result<()> {
        self.publish(name, document).await
    }
}

/// Delivery completion handler; only touches thread-safe counters and logs.
fn delivery_handler(metrics: Arc<PublisherMetrics>) -> DeliveryCallback {
    Arc::new(move |report: DeliveryReport| match &report.error {
        None => {
            metrics.deliveries_succeeded.inc();
            debug!(
                topic = %report.topic,
                partition = report.partition,
                offset = ?report.offset,
                "Message delivered"
            );
        }
        Some(error) => {
            metrics.deliveries_failed.inc();
            warn!(topic = %report.topic, %error, "Message delivery failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::codec::{Deserializer, JsonCodec};
    use crate::config::RetryPolicy;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    const ADDRESS: &str = "localhost:9092";

    fn config(capacity: usize, retry: RetryPolicy) -> PublisherConfig {
        PublisherConfig {
            queue_capacity: capacity,
            retry,
            ..PublisherConfig::with_address(ADDRESS)
        }
    }

    fn doc(value: serde_json::Value) -> Document {
        Document::new(value)
    }

    #[tokio::test]
    async fn test_connect_fails_when_unreachable() {
        let broker = MemoryBroker::new(ADDRESS);
        broker.set_reachable(false);

        let result = Publisher::connect(&broker, PublisherConfig::with_address(ADDRESS)).await;
        assert!(matches!(result, Err(BridgeError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let broker = MemoryBroker::new(ADDRESS);
        let result = Publisher::connect(&broker, PublisherConfig::with_address("no-port")).await;
        assert!(matches!(result, Err(BridgeError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_publish_serializes_name_and_document() {
        let broker = MemoryBroker::new(ADDRESS);
        let publisher = Publisher::connect(&broker, PublisherConfig::with_address(ADDRESS))
            .await
            .unwrap();

        publisher
            .publish(DocumentName::Start, doc(json!({"uid": "abc"})))
            .await
            .unwrap();
        publisher.close().await.unwrap();

        let records = broker.records(DOCUMENT_TOPIC);
        assert_eq!(records.len(), 1);
        let (name, decoded) = JsonCodec.deserialize(&records[0]).unwrap();
        assert_eq!(name, DocumentName::Start);
        assert_eq!(decoded, doc(json!({"uid": "abc"})));

        let metrics = publisher.metrics();
        assert_eq!(metrics.documents_published.get(), 1);
        assert_eq!(metrics.deliveries_succeeded.get(), 1);
        assert_eq!(metrics.backpressure_waits.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_recovers_within_wait() {
        let broker = MemoryBroker::new(ADDRESS);
        let publisher = Publisher::connect(
            &broker,
            config(1, RetryPolicy::new(2, Duration::from_secs(10))),
        )
        .await
        .unwrap();

        broker.pause_delivery();
        publisher.publish(DocumentName::Start, doc(json!(1))).await.unwrap();

        let resumer = broker.clone();
        let resume = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            resumer.resume_delivery();
        });

        let started = tokio::time::Instant::now();
        publisher.publish(DocumentName::Stop, doc(json!(2))).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(10));
        resume.await.unwrap();

        publisher.close().await.unwrap();
        assert_eq!(broker.records(DOCUMENT_TOPIC).len(), 2);
        assert_eq!(publisher.metrics().backpressure_waits.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_exhausted_raises_publish_error() {
        let broker = MemoryBroker::new(ADDRESS);
        let publisher = Publisher::connect(
            &broker,
            config(1, RetryPolicy::new(2, Duration::from_secs(10))),
        )
        .await
        .unwrap();

        broker.pause_delivery();
        publisher.publish(DocumentName::Start, doc(json!(1))).await.unwrap();

        let started = tokio::time::Instant::now();
        let err = publisher
            .publish(DocumentName::Event, doc(json!(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Publish(ref msg) if msg.contains("2 attempt(s)")));
        assert!(started.elapsed() >= Duration::from_secs(10));

        let metrics = publisher.metrics();
        assert_eq!(metrics.backpressure_waits.get(), 1);
        assert_eq!(metrics.publish_failures.get(), 1);
        assert_eq!(metrics.documents_published.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy_fails_immediately() {
        let broker = MemoryBroker::new(ADDRESS);
        let publisher = Publisher::connect(
            &broker,
            config(1, RetryPolicy::new(1, Duration::from_secs(10))),
        )
        .await
        .unwrap();

        broker.pause_delivery();
        publisher.publish(DocumentName::Start, doc(json!(1))).await.unwrap();

        let started = tokio::time::Instant::now();
        let result = publisher.publish(DocumentName::Stop, doc(json!(2))).await;
        assert!(matches!(result, Err(BridgeError::Publish(_))));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_publish() {
        let broker = MemoryBroker::new(ADDRESS);
        let publisher = Publisher::connect(&broker, PublisherConfig::with_address(ADDRESS))
            .await
            .unwrap();

        publisher.publish(DocumentName::Start, doc(json!({}))).await.unwrap();
        publisher.close().await.unwrap();
        publisher.close().await.unwrap();
        assert!(publisher.is_closed());
        assert_eq!(broker.records(DOCUMENT_TOPIC).len(), 1);

        let result = publisher.publish(DocumentName::Stop, doc(json!({}))).await;
        assert!(matches!(result, Err(BridgeError::IllegalState(_))));
        assert_eq!(broker.records(DOCUMENT_TOPIC).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_times_out_on_stalled_broker() {
        let broker = MemoryBroker::new(ADDRESS);
        let mut cfg = PublisherConfig::with_address(ADDRESS);
        cfg.flush_timeout_ms = 500;
        let publisher = Publisher::connect(&broker, cfg).await.unwrap();

        broker.pause_delivery();
        publisher.publish(DocumentName::Start, doc(json!({}))).await.unwrap();

        let err = publisher.close().await.unwrap_err();
        assert_eq!(err, BridgeError::Timeout { timeout_ms: 500 });
        // Still undrained, so a later close keeps waiting.
        let err = publisher.close().await.unwrap_err();
        assert_eq!(err, BridgeError::Timeout { timeout_ms: 500 });
        assert_eq!(publisher.producer().in_flight(), 1);
        assert!(broker.records(DOCUMENT_TOPIC).is_empty());

        broker.resume_delivery();
        publisher.close().await.unwrap();
        assert_eq!(broker.records(DOCUMENT_TOPIC).len(), 1);

        publisher.close().await.unwrap();
        assert_eq!(broker.records(DOCUMENT_TOPIC).len(), 1);
        assert_eq!(publisher.metrics().deliveries_succeeded.get(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failures_are_counted_not_raised() {
        let broker = MemoryBroker::new(ADDRESS);
        let publisher = Publisher::connect(&broker, PublisherConfig::with_address(ADDRESS))
            .await
            .unwrap();

        broker.set_reachable(false);
        publisher.publish(DocumentName::Event, doc(json!({"seq": 1}))).await.unwrap();
        publisher.close().await.unwrap();

        let metrics = publisher.metrics();
        assert_eq!(metrics.deliveries_failed.get(), 1);
        assert_eq!(metrics.deliveries_succeeded.get(), 0);
    }

    #[tokio::test]
    async fn test_custom_serializer_and_sink() {
        let broker = MemoryBroker::new(ADDRESS);
        let publisher = Publisher::connect(&broker, PublisherConfig::with_address(ADDRESS))
            .await
            .unwrap()
            .with_serializer(|name: DocumentName, _doc: &Document| -> Result<Bytes> {
                Ok(Bytes::from(format!("custom:{}", name)))
            });

        let sink: &dyn DocumentSink = &publisher;
        sink.emit(DocumentName::Descriptor, doc(json!({}))).await.unwrap();
        publisher.close().await.unwrap();

        assert_eq!(&broker.records(DOCUMENT_TOPIC)[0][..], b"custom:descriptor");
    }

    #[tokio::test]
    async fn test_serializer_failure_is_surfaced() {
        let broker = MemoryBroker::new(ADDRESS);
        let publisher = Publisher::connect(&broker, PublisherConfig::with_address(ADDRESS))
            .await
            .unwrap()
            .with_serializer(|_: DocumentName, _: &Document| -> Result<Bytes> {
                Err(BridgeError::Serialization("unsupported value".to_string()))
            });

        let result = publisher.publish(DocumentName::Event, doc(json!({}))).await;
        assert!(matches!(result, Err(BridgeError::Serialization(_))));
        assert_eq!(publisher.metrics().publish_failures.get(), 1);
    }
}
