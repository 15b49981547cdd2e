//! Serialization (C3): pluggable encode/decode between a generic value and a frame
//! payload. A JSON text codec is always available; other codecs (MessagePack,
//! Protobuf, Arrow) are external collaborators satisfying this trait (§1 Out of scope).
//!
//! The codec never sees an [`Envelope`](crate::protocol::Envelope) directly — it only
//! knows about [`serde_json::Value`]; classifying a decoded value into a request,
//! response, or notification is [`crate::protocol::parse`]'s job.

use crate::error::{CoreError, Result};
use serde_json::Value;

/// A pluggable value codec.
///
/// Decode failures are reported as [`CoreError::Serialization`] and must not crash the
/// owning channel — the channel drops the one offending frame and continues (§7).
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;
    fn content_type(&self) -> &'static str;
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Default text codec: JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
