//! Bridge between a local document dispatcher and a message broker topic.
//!
//! A [`Publisher`] serializes named documents onto the shared document topic;
//! a [`RemoteDispatcher`] reads them back, possibly in another process, and
//! re-emits them to local subscribers in receipt order.

pub mod broker;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod publisher;
pub mod remote;
pub mod types;

pub use codec::{Deserializer, JsonCodec, Serializer};
pub use config::{
    BridgeConfig, DeserializationPolicy, DispatcherConfig, OffsetReset, PublisherConfig,
    RetryPolicy,
};
pub use dispatcher::{Dispatcher, SubscriptionToken};
pub use error::{BridgeError, Result};
pub use publisher::{DocumentSink, Publisher};
pub use remote::{LifecycleState, RemoteDispatcher, ShutdownHandle};
pub use types::{Document, DocumentName, DEFAULT_GROUP_ID, DOCUMENT_TOPIC};
