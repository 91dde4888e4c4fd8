//! Wire representation of an [`Envelope`] for the Redis and Kafka backends.
//!
//! The field set is fixed:
//!
//! | field     | meaning                                   |
//! |-----------|-------------------------------------------|
//! | `id`      | event id (UUID string)                    |
//! | `type`    | routing key                               |
//! | `time`    | creation time, nanoseconds since epoch    |
//! | `payload` | serialized payload as a UTF-8 string      |
//!
//! Redis stores these as stream entry fields (every value a string); Kafka
//! carries them as a JSON object in the message value.

use crate::event::Envelope;
use crate::event_bus::{EventBusError, Result};
use serde::{Deserialize, Serialize};

/// Field name of the event id.
pub const FIELD_ID: &str = "id";
/// Field name of the event type.
pub const FIELD_TYPE: &str = "type";
/// Field name of the creation timestamp.
pub const FIELD_TIME: &str = "time";
/// Field name of the payload.
pub const FIELD_PAYLOAD: &str = "payload";

/// Flat, backend-neutral form of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Event id.
    pub id: String,
    /// Routing key.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Nanoseconds since the Unix epoch.
    pub time: i64,
    /// Serialized payload.
    pub payload: String,
}

impl WireEvent {
    /// Flatten an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Serialization`] if the payload bytes are not UTF-8.
    /// Envelopes built with [`Envelope::new`] always carry UTF-8 JSON.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let payload = String::from_utf8(envelope.payload().to_vec())
            .map_err(|e| EventBusError::Serialization(format!("payload is not UTF-8: {e}")))?;

        Ok(Self {
            id: envelope.id().to_string(),
            event_type: envelope.event_type().to_string(),
            time: envelope.timestamp_nanos(),
            payload,
        })
    }

    /// Rebuild the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::MalformedEvent`] if the id is not a valid UUID.
    pub fn into_envelope(self) -> Result<Envelope> {
        Envelope::decode(&self.id, self.time, self.event_type, self.payload.into_bytes())
    }

    /// Field/value pairs for a Redis stream entry.
    #[must_use]
    pub fn to_fields(&self) -> [(&'static str, String); 4] {
        [
            (FIELD_ID, self.id.clone()),
            (FIELD_TYPE, self.event_type.clone()),
            (FIELD_TIME, self.time.to_string()),
            (FIELD_PAYLOAD, self.payload.clone()),
        ]
    }

    /// Parse stream entry fields, looked up through `field`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::MalformedEvent`] if a field is missing or `time`
    /// is not an integer.
    pub fn from_fields<F>(field: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &str| {
            field(name).ok_or_else(|| EventBusError::MalformedEvent(format!("missing field '{name}'")))
        };

        let time = require(FIELD_TIME)?;
        let time = time
            .parse::<i64>()
            .map_err(|e| EventBusError::MalformedEvent(format!("invalid time {time:?}: {e}")))?;

        Ok(Self {
            id: require(FIELD_ID)?,
            event_type: require(FIELD_TYPE)?,
            time,
            payload: require(FIELD_PAYLOAD)?,
        })
    }

    /// Encode as a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EventBusError::Serialization(e.to_string()))
    }

    /// Decode from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::MalformedEvent`] if the bytes are not a JSON
    /// object with the expected fields.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| EventBusError::MalformedEvent(e.to_string()))
    }
}
