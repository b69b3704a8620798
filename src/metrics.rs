use prometheus::{IntCounter, Registry};
use std::sync::Arc;

use crate::error::Result;

/// Counters maintained by a [`crate::Publisher`].
///
/// Delivery counters are updated from the broker client's delivery task, so
/// every field is safe to touch from any thread.
pub struct PublisherMetrics {
    pub documents_published: IntCounter,
    pub bytes_published: IntCounter,
    pub backpressure_waits: IntCounter,
    pub publish_failures: IntCounter,
    pub deliveries_succeeded: IntCounter,
    pub deliveries_failed: IntCounter,
    pub registry: Registry,
}

/// Counters maintained by a [`crate::RemoteDispatcher`].
pub struct DispatcherMetrics {
    pub messages_received: IntCounter,
    pub documents_dispatched: IntCounter,
    pub empty_polls: IntCounter,
    pub broker_errors: IntCounter,
    pub deserialization_failures: IntCounter,
    pub registry: Registry,
}

impl PublisherMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let documents_published = register(
            &registry,
            "docbridge_documents_published_total",
            "Documents accepted by the producer queue",
        )?;
        let bytes_published = register(
            &registry,
            "docbridge_bytes_published_total",
            "Serialized bytes accepted by the producer queue",
        )?;
        let backpressure_waits = register(
            &registry,
            "docbridge_backpressure_waits_total",
            "Times publish waited for producer queue space",
        )?;
        let publish_failures = register(
            &registry,
            "docbridge_publish_failures_total",
            "Documents that could not be submitted",
        )?;
        let deliveries_succeeded = register(
            &registry,
            "docbridge_deliveries_succeeded_total",
            "Broker-confirmed deliveries",
        )?;
        let deliveries_failed = register(
            &registry,
            "docbridge_deliveries_failed_total",
            "Deliveries the broker reported as failed",
        )?;

        Ok(Arc::new(Self {
            documents_published,
            bytes_published,
            backpressure_waits,
            publish_failures,
            deliveries_succeeded,
            deliveries_failed,
            registry,
        }))
    }
}

impl DispatcherMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let messages_received = register(
            &registry,
            "docbridge_messages_received_total",
            "Messages returned by the consumer",
        )?;
        let documents_dispatched = register(
            &registry,
            "docbridge_documents_dispatched_total",
            "Documents handed to local subscribers",
        )?;
        let empty_polls = register(
            &registry,
            "docbridge_empty_polls_total",
            "Polls that timed out without a message",
        )?;
        let broker_errors = register(
            &registry,
            "docbridge_broker_errors_total",
            "Errors reported by the broker while polling",
        )?;
        let deserialization_failures = register(
            &registry,
            "docbridge_deserialization_failures_total",
            "Payloads that could not be decoded",
        )?;

        Ok(Arc::new(Self {
            messages_received,
            documents_dispatched,
            empty_polls,
            broker_errors,
            deserialization_failures,
            registry,
        }))
    }
}

fn register(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
