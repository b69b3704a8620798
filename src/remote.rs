//! Receiving side of the bridge.
//!
//! A [`RemoteDispatcher`] is single use: `created -> running -> stopped`.
//! Once stopped it cannot be started again and a new instance is needed.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConnector, BrokerConsumer, ReceivedMessage};
use crate::codec::{Deserializer, JsonCodec};
use crate::config::{DeserializationPolicy, DispatcherConfig};
use crate::dispatcher::{Dispatcher, SubscriptionToken};
use crate::error::{BridgeError, Result};
use crate::metrics::DispatcherMetrics;
use crate::types::{Document, DocumentName, DOCUMENT_TOPIC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug)]
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Created as u8))
    }

    fn get(&self) -> LifecycleState {
        match self.0.load(Ordering::Acquire) {
            0 => LifecycleState::Created,
            1 => LifecycleState::Running,
            _ => LifecycleState::Stopped,
        }
    }

    fn set(&self, state: LifecycleState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Stops a running [`RemoteDispatcher`] from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Consumer checked out for the duration of the receive loop.
///
/// Dropping the lease releases the consumer, so the handle is closed even if
/// the loop panics or the `start()` future is dropped mid-poll.
struct ConsumerLease<C: BrokerConsumer> {
    consumer: C,
    released: bool,
    lifecycle: Arc<Lifecycle>,
}

impl<C: BrokerConsumer> ConsumerLease<C> {
    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.lifecycle.set(LifecycleState::Stopped);
        self.consumer.close()
    }
}

impl<C: BrokerConsumer> Drop for ConsumerLease<C> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Failed to release consumer");
        }
    }
}

/// Receives wire messages from the document topic and re-emits them to
/// local subscribers in the order the broker delivered them.
///
/// # Example
///
/// ```rust,no_run
/// use docbridge::{broker::MemoryBroker, DispatcherConfig, RemoteDispatcher};
///
/// # async fn run() -> docbridge::Result<()> {
/// let broker = MemoryBroker::new("localhost:9092");
/// let mut remote =
///     RemoteDispatcher::connect(&broker, DispatcherConfig::with_address("localhost:9092")).await?;
/// remote.subscribe(|name, doc| println!("{}: {}", name, doc));
///
/// let shutdown = remote.shutdown_handle();
/// tokio::spawn(async move {
///     let _ = tokio::signal::ctrl_c().await;
///     shutdown.stop();
/// });
/// remote.start().await?; // runs until stopped
/// # Ok(())
/// # }
/// ```
pub struct RemoteDispatcher<C: BrokerConsumer> {
    config: DispatcherConfig,
    consumer: Option<C>,
    deserializer: Arc<dyn Deserializer>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<Lifecycle>,
    shutdown: CancellationToken,
    metrics: Arc<DispatcherMetrics>,
}

impl<C: BrokerConsumer> RemoteDispatcher<C> {
    /// Open a consumer in `config.group_id` subscribed to the document topic.
    pub async fn connect<K>(connector: &K, config: DispatcherConfig) -> Result<Self>
    where
        K: BrokerConnector<Consumer = C>,
    {
        config.validate()?;
        let consumer = connector.connect_consumer(&config, &[DOCUMENT_TOPIC]).await?;
        Self::new(consumer, config)
    }

    /// Wrap a consumer that is already subscribed to the document topic.
    pub fn new(consumer: C, config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            consumer: Some(consumer),
            deserializer: Arc::new(JsonCodec),
            dispatcher: Arc::new(Dispatcher::new()),
            lifecycle: Arc::new(Lifecycle::new()),
            shutdown: CancellationToken::new(),
            metrics: DispatcherMetrics::new()?,
        })
    }

    pub fn with_deserializer<D: Deserializer + 'static>(mut self, deserializer: D) -> Self {
        self.deserializer = Arc::new(deserializer);
        self
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(DocumentName, &Document) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(callback)
    }

    pub fn subscribe_to<F>(&self, name: DocumentName, callback: F) -> SubscriptionToken
    where
        F: Fn(DocumentName, &Document) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe_to(name, callback)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.dispatcher.unsubscribe(token)
    }

    /// Shared fan-out, usable to (un)subscribe while `start()` is running.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.get()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        self.metrics.clone()
    }

    /// Run the receive loop until stopped through a [`ShutdownHandle`] or
    /// until an unrecoverable error occurs.
    ///
    /// Whatever the exit path, the consumer is released and the instance is
    /// left `Stopped` before this returns.
    pub async fn start(&mut self) -> Result<()> {
        match self.lifecycle.get() {
            LifecycleState::Created => {}
            LifecycleState::Running => {
                return Err(BridgeError::IllegalState(
                    "this RemoteDispatcher is already running".to_string(),
                ));
            }
            LifecycleState::Stopped => {
                return Err(BridgeError::IllegalState(format!(
                    "this RemoteDispatcher (group '{}' at {}) has already been started and \
                     interrupted; create a fresh instance",
                    self.config.group_id, self.config.address
                )));
            }
        }

        let Some(consumer) = self.consumer.take() else {
            self.lifecycle.set(LifecycleState::Stopped);
            return Err(BridgeError::IllegalState(
                "consumer has already been released".to_string(),
            ));
        };

        let mut lease = ConsumerLease {
            consumer,
            released: false,
            lifecycle: self.lifecycle.clone(),
        };
        self.lifecycle.set(LifecycleState::Running);
        info!(
            address = %self.config.address,
            group_id = %self.config.group_id,
            topic = DOCUMENT_TOPIC,
            "Remote dispatcher started"
        );

        let outcome = self.receive_loop(&mut lease.consumer).await;
        let released = lease.release();

        match &outcome {
            Ok(()) => info!(group_id = %self.config.group_id, "Remote dispatcher stopped"),
            Err(e) => error!(
                group_id = %self.config.group_id,
                error = %e,
                category = e.category(),
                "Remote dispatcher stopped on error"
            ),
        }

        outcome.and(released)
    }

    /// Release the consumer and mark the instance stopped.
    ///
    /// Safe to call repeatedly; only the first call closes the consumer. To
    /// interrupt a running `start()`, use [`RemoteDispatcher::shutdown_handle`].
    pub fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();
        self.lifecycle.set(LifecycleState::Stopped);

        match self.consumer.take() {
            Some(mut consumer) => consumer.close(),
            None => Ok(()),
        }
    }

    async fn receive_loop(&self, consumer: &mut C) -> Result<()> {
        let poll_timeout = self.config.poll_timeout();

        loop {
            let polled = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Shutdown requested");
                    return Ok(());
                }
                polled = consumer.poll(poll_timeout) => polled,
            };

            match polled {
                None => self.metrics.empty_polls.inc(),
                Some(Err(BridgeError::BrokerReported(error))) => {
                    self.metrics.broker_errors.inc();
                    warn!(%error, "Consumer error");
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(message)) => self.handle_message(message)?,
            }
        }
    }

    fn handle_message(&self, message: ReceivedMessage) -> Result<()> {
        self.metrics.messages_received.inc();
        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            bytes = message.payload.len(),
            "Received message"
        );

        match self.deserializer.deserialize(&message.payload) {
            Ok((name, document)) => {
                let subscribers = self.dispatcher.process(name, &document);
                self.metrics.documents_dispatched.inc();
                debug!(%name, subscribers, offset = message.offset, "Dispatched document");
                Ok(())
            }
            Err(e) => {
                self.metrics.deserialization_failures.inc();
                match self.config.on_deserialization_error {
                    DeserializationPolicy::Skip => {
                        warn!(
                            offset = message.offset,
                            error = %e,
                            skipped = self.metrics.deserialization_failures.get(),
                            "Skipping undecodable message"
                        );
                        Ok(())
                    }
                    DeserializationPolicy::Fail => Err(e),
                }
            }
        }
    }
}

impl<C: BrokerConsumer> Drop for RemoteDispatcher<C> {
    fn drop(&mut self) {
        if let Some(mut consumer) = self.consumer.take() {
            if let Err(e) = consumer.close() {
                warn!(error = %e, "Failed to release consumer on drop");
            }
        }
    }
}
