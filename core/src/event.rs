//! The event envelope: one published occurrence of an event type.
//!
//! An [`Envelope`] is created by the publishing side with [`Envelope::new`] and
//! rebuilt on the consuming side with [`Envelope::decode`]. The bus never looks
//! inside the payload; it is carried as the JSON bytes produced at publish time.
//!
//! # Identity
//!
//! Envelopes compare equal if and only if their ids are equal. Ids are random
//! UUIDs generated at creation and never reused.
//!
//! # Example
//!
//! ```
//! use dddbus_core::event::Envelope;
//!
//! let envelope = Envelope::new("order.created", &serde_json::json!({ "id": 1 }))?;
//!
//! let decoded = Envelope::decode(
//!     &envelope.id().to_string(),
//!     envelope.timestamp_nanos(),
//!     envelope.event_type(),
//!     envelope.payload().to_vec(),
//! )?;
//!
//! assert_eq!(decoded, envelope);
//! assert_eq!(decoded.occurred_at(), envelope.occurred_at());
//! # Ok::<(), dddbus_core::event_bus::EventBusError>(())
//! ```

use crate::event_bus::{EventBusError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Immutable record of one published event.
#[derive(Clone, Debug)]
pub struct Envelope {
    id: Uuid,
    event_type: String,
    occurred_at: DateTime<Utc>,
    payload: Vec<u8>,
}

impl Envelope {
    /// Create a new envelope, serializing `payload` to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Serialization`] if `payload` cannot be serialized.
    pub fn new<T>(event_type: impl Into<String>, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let payload =
            serde_json::to_vec(payload).map_err(|e| EventBusError::Serialization(e.to_string()))?;

        Ok(Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            occurred_at: Utc::now(),
            payload,
        })
    }

    /// Rebuild an envelope from its wire parts.
    ///
    /// `time_nanos` is the creation time in nanoseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::MalformedEvent`] if `id` is not a valid UUID.
    pub fn decode(
        id: &str,
        time_nanos: i64,
        event_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let id = Uuid::parse_str(id)
            .map_err(|e| EventBusError::MalformedEvent(format!("invalid event id {id:?}: {e}")))?;

        Ok(Self {
            id,
            event_type: event_type.into(),
            occurred_at: DateTime::from_timestamp_nanos(time_nanos),
            payload: payload.into(),
        })
    }

    /// Globally unique id of this event.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Routing key of this event.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// When the event was created.
    #[must_use]
    pub const fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Creation time in nanoseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp_nanos(&self) -> i64 {
        // Always in range: built from `Utc::now()` or from an i64 nanosecond value.
        self.occurred_at.timestamp_nanos_opt().unwrap_or_default()
    }

    /// Serialized payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Deserialize the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Serialization`] if the payload is not valid JSON
    /// for `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| EventBusError::Serialization(e.to_string()))
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Envelope {}

impl Hash for Envelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event{{id={} type={} time={} payload={}}}",
            self.id,
            self.event_type,
            self.occurred_at.to_rfc3339(),
            String::from_utf8_lossy(&self.payload)
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderCreated {
        id: u64,
    }

    #[test]
    fn new_envelope_serializes_payload_as_json() {
        let envelope = Envelope::new("order.created", &OrderCreated { id: 1 }).unwrap();

        assert_eq!(envelope.event_type(), "order.created");
        assert_eq!(envelope.payload(), br#"{"id":1}"#);
        assert_eq!(envelope.payload_as::<OrderCreated>().unwrap(), OrderCreated { id: 1 });
    }

    #[test]
    fn ids_are_unique() {
        let a = Envelope::new("test", "hello").unwrap();
        let b = Envelope::new("test", "hello").unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
    }

    #[test]
    fn decode_keeps_nanosecond_time() {
        let envelope = Envelope::new("test", "hello").unwrap();
        let decoded = Envelope::decode(
            &envelope.id().to_string(),
            envelope.timestamp_nanos(),
            "test",
            envelope.payload().to_vec(),
        )
        .unwrap();

        assert_eq!(decoded.timestamp_nanos(), envelope.timestamp_nanos());
        assert_eq!(decoded.occurred_at(), envelope.occurred_at());
        assert_eq!(decoded.payload(), envelope.payload());
    }

    #[test]
    fn decode_rejects_invalid_id() {
        let err = Envelope::decode("not-a-uuid", 0, "test", b"{}".to_vec()).unwrap_err();
        assert!(matches!(err, EventBusError::MalformedEvent(_)));
    }

    #[test]
    fn serialization_failure_is_reported() {
        use std::collections::HashMap;

        // JSON object keys must be strings
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);

        let err = Envelope::new("test", &bad).unwrap_err();
        assert!(matches!(err, EventBusError::Serialization(_)));
    }

    #[test]
    fn equality_is_by_id_only() {
        let envelope = Envelope::new("test", "hello").unwrap();
        let same_id = Envelope::decode(&envelope.id().to_string(), 0, "other", b"\"x\"".to_vec()).unwrap();
        assert_eq!(envelope, same_id);
    }

    #[test]
    fn display_shows_type_and_payload() {
        let envelope = Envelope::new("order.created", &OrderCreated { id: 1 }).unwrap();
        let rendered = envelope.to_string();
        assert!(rendered.starts_with("event{id="));
        assert!(rendered.contains("type=order.created"));
        assert!(rendered.contains(r#"payload={"id":1}"#));
    }
}
