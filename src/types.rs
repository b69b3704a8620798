use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

pub type TopicName = String;
pub type PartitionId = i32;
pub type Offset = i64;

/// Topic shared by every publisher and remote dispatcher.
pub const DOCUMENT_TOPIC: &str = "bluesky-event";

/// Consumer group used when none is configured.
pub const DEFAULT_GROUP_ID: &str = "kafka-bluesky";

/// Role of a document within an emitted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentName {
    Start,
    Descriptor,
    Event,
    Stop,
    Resource,
    Datum,
    BulkEvents,
    BulkDatum,
    EventPage,
    DatumPage,
}

impl DocumentName {
    pub const ALL: [DocumentName; 10] = [
        DocumentName::Start,
        DocumentName::Descriptor,
        DocumentName::Event,
        DocumentName::Stop,
        DocumentName::Resource,
        DocumentName::Datum,
        DocumentName::BulkEvents,
        DocumentName::BulkDatum,
        DocumentName::EventPage,
        DocumentName::DatumPage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentName::Start => "start",
            DocumentName::Descriptor => "descriptor",
            DocumentName::Event => "event",
            DocumentName::Stop => "stop",
            DocumentName::Resource => "resource",
            DocumentName::Datum => "datum",
            DocumentName::BulkEvents => "bulk_events",
            DocumentName::BulkDatum => "bulk_datum",
            DocumentName::EventPage => "event_page",
            DocumentName::DatumPage => "datum_page",
        }
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentName {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| BridgeError::Deserialization(format!("unknown document name '{}'", s)))
    }
}

/// Opaque, immutable document payload.
///
/// The bridge never looks inside; it only carries the value alongside its
/// [`DocumentName`]. Cloning produces a fully independent copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(serde_json::Value);

impl Document {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for Document {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
