//! Wire codecs for `(DocumentName, Document)` pairs.
//!
//! A publisher and the remote dispatchers reading its topic must use codecs
//! that are exact inverses of each other. The bridge does not check this; it
//! simply hands the bytes through. [`JsonCodec`] is the default and encodes a
//! pair as a two element JSON array: `["start", {"uid": "abc"}]`.

use bytes::Bytes;
use serde_json::Value;

use crate::error::{BridgeError, Result};
use crate::types::{Document, DocumentName};

/// Turns a named document into a wire message.
pub trait Serializer: Send + Sync {
    fn serialize(&self, name: DocumentName, document: &Document) -> Result<Bytes>;
}

/// Turns a wire message back into a named document.
pub trait Deserializer: Send + Sync {
    fn deserialize(&self, payload: &[u8]) -> Result<(DocumentName, Document)>;
}

impl<F> Serializer for F
where
    F: Fn(DocumentName, &Document) -> Result<Bytes> + Send + Sync,
{
    fn serialize(&self, name: DocumentName, document: &Document) -> Result<Bytes> {
        self(name, document)
    }
}

impl<F> Deserializer for F
where
    F: Fn(&[u8]) -> Result<(DocumentName, Document)> + Send + Sync,
{
    fn deserialize(&self, payload: &[u8]) -> Result<(DocumentName, Document)> {
        self(payload)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Serializer for JsonCodec {
    fn serialize(&self, name: DocumentName, document: &Document) -> Result<Bytes> {
        let encoded = serde_json::to_vec(&(name, document))?;
        Ok(Bytes::from(encoded))
    }
}

impl Deserializer for JsonCodec {
    fn deserialize(&self, payload: &[u8]) -> Result<(DocumentName, Document)> {
        let (name, value): (String, Value) = serde_json::from_slice(payload)
            .map_err(|e| BridgeError::Deserialization(format!("malformed wire message: {}", e)))?;
        let name = name.parse::<DocumentName>()?;
        Ok((name, Document::new(value)))
    }
}
