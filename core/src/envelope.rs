//! Wire envelope wrapping every message that crosses the broker.
//!
//! ```json
//! { "key": "abc", "headers": { "requestId": "abc" }, "value": { ... } }
//! ```
//!
//! `requestId` is the cross-service correlation id. When present it wins over
//! any explicit `key` and becomes the broker message key.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Header carrying the cross-service correlation id.
pub const REQUEST_ID_HEADER: &str = "requestId";

/// Failures turning envelopes into bytes and back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Value could not be serialized.
    #[error("Failed to serialize envelope value: {0}")]
    Serialization(String),

    /// Payload could not be deserialized.
    #[error("Failed to deserialize payload: {0}")]
    Deserialization(String),
}

/// `{ key, headers, value }` wrapper around a payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Explicit broker key. Overridden by `requestId` when that header is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// String headers. `requestId` is the only one with meaning to this layer.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Payload.
    pub value: T,
}

impl<T> Envelope<T> {
    /// Envelope with no key and no headers.
    pub const fn new(value: T) -> Self {
        Self {
            key: None,
            headers: BTreeMap::new(),
            value,
        }
    }

    /// Set the `requestId` header.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.headers
            .insert(REQUEST_ID_HEADER.to_string(), request_id.into());
        self
    }

    /// Set an explicit key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a custom header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The correlation id, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(REQUEST_ID_HEADER).map(String::as_str)
    }

    /// Key the broker message is published under.
    #[must_use]
    pub fn broker_key(&self) -> Option<&str> {
        self.request_id().or(self.key.as_deref())
    }

    /// Replace the payload, keeping key and headers.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            key: self.key,
            headers: self.headers,
            value: f(self.value),
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// Encode for the broker: key resolved, value as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Serialization`] if the value does not serialize.
    pub fn to_wire(&self) -> Result<WireMessage, EnvelopeError> {
        let payload = serde_json::to_vec(&self.value)
            .map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
        Ok(WireMessage {
            key: self.broker_key().map(str::to_string),
            headers: self.headers.clone(),
            payload,
        })
    }

    /// Convert the payload to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Serialization`] if the value does not serialize.
    pub fn to_json(&self) -> Result<Envelope<serde_json::Value>, EnvelopeError> {
        let value = serde_json::to_value(&self.value)
            .map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
        Ok(Envelope {
            key: self.key.clone(),
            headers: self.headers.clone(),
            value,
        })
    }
}

/// A message as handed to the broker client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    /// Resolved broker key.
    pub key: Option<String>,
    /// Headers, copied verbatim into broker message headers.
    pub headers: BTreeMap<String, String>,
    /// JSON-encoded value.
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// The `requestId` header, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(REQUEST_ID_HEADER).map(String::as_str)
    }

    /// Rebuild an envelope on the receiving side.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Deserialization`] if the payload is not valid
    /// JSON for `T`.
    pub fn into_envelope<T: DeserializeOwned>(self) -> Result<Envelope<T>, EnvelopeError> {
        let value = decode_payload(&self.payload)?;
        Ok(Envelope {
            key: self.key,
            headers: self.headers,
            value,
        })
    }
}

/// Decode a JSON payload.
///
/// An empty payload decodes as JSON `null`, which lets `()` replies through.
///
/// # Errors
///
/// Returns [`EnvelopeError::Deserialization`] on malformed input.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, EnvelopeError> {
    let bytes: &[u8] = if payload.is_empty() { b"null" } else { payload };
    serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Deserialization(e.to_string()))
}
