//! Domain event envelope.
//!
//! The envelope is the only thing that travels between services. It is
//! encoded as UTF-8 JSON with the shape
//! `{ "event_type": ..., "entity": ..., "payload": {...}, "emitted_at": ... }`.
//! There is no sequence number: consumers must not assume a total order.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Content type attached to published messages.
pub const CONTENT_TYPE: &str = "application/json";

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Payload could not be turned into JSON. Raised before any network call.
    #[error("Serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Received bytes are not a valid envelope (poison message).
    #[error("Deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),
}

/// Kind of change an envelope describes.
///
/// `CREATED`, `UPDATED` and `DELETED` are shared by every entity. Entity
/// specific kinds (e.g. `FINALIZED` for grades) either have a variant here
/// or round-trip through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    Finalized,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Created => "CREATED",
            EventType::Updated => "UPDATED",
            EventType::Deleted => "DELETED",
            EventType::Finalized => "FINALIZED",
            EventType::Other(name) => name,
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CREATED" => EventType::Created,
            "UPDATED" => EventType::Updated,
            "DELETED" => EventType::Deleted,
            "FINALIZED" => EventType::Finalized,
            _ => EventType::Other(value),
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        EventType::from(value.to_string())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

/// A published domain-entity change.
///
/// Envelopes are immutable once published. `payload` and `emitted_at` are
/// optional on the wire so that older or foreign producers can still be
/// consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub entity: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitted_at: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    /// Build an envelope stamped with the current time.
    pub fn new(entity: impl Into<String>, event_type: impl Into<EventType>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            entity: entity.into(),
            payload,
            emitted_at: Some(Utc::now()),
        }
    }

    /// Build an envelope from any serializable payload.
    ///
    /// Fails synchronously when the payload cannot be represented as JSON
    /// (e.g. a map with non-string keys).
    pub fn from_payload<T: Serialize + ?Sized>(
        entity: impl Into<String>,
        event_type: impl Into<EventType>,
        payload: &T,
    ) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(payload).map_err(EnvelopeError::Serialization)?;
        Ok(Self::new(entity, event_type, payload))
    }

    /// Payload fields, if the payload is a JSON object.
    pub fn fields(&self) -> Option<&Map<String, Value>> {
        self.payload.as_object()
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Serialization)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Deserialization)
    }
}
