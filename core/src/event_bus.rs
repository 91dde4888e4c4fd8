//! Event bus abstraction shared by every backend.
//!
//! This module provides the [`EventBus`] trait for publishing events by type and
//! registering named handlers for those types. Three backends implement it:
//!
//! - `InMemoryEventBus` (`dddbus-memory`) - one process, one dispatch queue
//! - `RedisEventBus` (`dddbus-redis`) - Redis Streams with consumer groups
//! - `KafkaEventBus` (`dddbus-kafka`) - Kafka topics with consumer groups
//!
//! # Architecture
//!
//! ```text
//!  publish(type, payload)
//!          │
//!          ▼
//!  ┌────────────────┐
//!  │    Envelope    │  id, type, occurred_at, payload
//!  └───────┬────────┘
//!          │ write
//!          ▼
//!  ┌────────────────┐
//!  │    Backend     │  channel / stream / topic
//!  └───────┬────────┘
//!          │ read (one reader per event type)
//!          ▼
//!  ┌────────────────┐
//!  │ Type Consumer  │──► [queue] ──► worker ──► handler A
//!  │                │──► [queue] ──► worker ──► handler B
//!  └────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! - **Per-handler FIFO**: each handler sees events of a type in the order the
//!   consumer read them
//! - **No cross-handler ordering**: every handler has its own queue and may lag
//! - **Ack before dispatch**: the Redis and Kafka backends acknowledge a message
//!   on receipt, so a failing handler never causes redelivery
//!
//! # Example
//!
//! ```rust,ignore
//! use dddbus_core::event_bus::{EventBus, EventBusExt};
//! use dddbus_core::handler::handler_fn;
//!
//! async fn example(bus: &dyn EventBus) -> Result<(), dddbus_core::event_bus::EventBusError> {
//!     let subscription = bus
//!         .subscribe("order.created", "billing", handler_fn(|event| {
//!             println!("billing saw {event}");
//!         }))
//!         .await?;
//!
//!     bus.publish("order.created", &serde_json::json!({ "id": 1 })).await?;
//!
//!     bus.unsubscribe(&subscription).await
//! }
//! ```

use crate::event::Envelope;
use crate::handler::EventHandler;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// The backend could not be reached.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A consumer group or topic could not be created.
    #[error("Provisioning failed for '{resource}': {reason}")]
    Provisioning {
        /// Stream key or topic name
        resource: String,
        /// The reason for failure
        reason: String,
    },

    /// A payload could not be serialized or deserialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// A message read from the backend could not be decoded into an envelope.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Writing an event to the backend failed.
    #[error("Publish failed for event type '{event_type}': {reason}")]
    Publish {
        /// The event type that failed
        event_type: String,
        /// The reason for failure
        reason: String,
    },

    /// Event types must be non-empty.
    #[error("Invalid event type: {0:?}")]
    InvalidEventType(String),

    /// The bus has been shut down.
    #[error("Event bus is closed")]
    Closed,
}

/// Result alias used throughout the bus crates.
pub type Result<T> = std::result::Result<T, EventBusError>;

/// Boxed future returned by [`EventBus`] methods.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Token identifying one registered handler.
///
/// Returned by [`EventBus::subscribe`] and required by [`EventBus::unsubscribe`].
/// Registering the same `(event_type, handler_name)` twice yields two distinct
/// tokens and two independent handler workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    event_type: String,
    handler_name: String,
}

impl Subscription {
    pub(crate) const fn new(id: u64, event_type: String, handler_name: String) -> Self {
        Self {
            id,
            event_type,
            handler_name,
        }
    }

    /// Unique id of this registration within its bus.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The event type this handler is registered for.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The name the handler was registered under.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.event_type, self.handler_name, self.id)
    }
}

/// Trait for event bus implementations.
///
/// All methods may be called concurrently from many tasks. Buses are built
/// explicitly and shared as `Arc<dyn EventBus>`; there is no global instance.
///
/// # Dyn Compatibility
///
/// Methods return [`BusFuture`] instead of using `async fn` so the trait can be
/// used as a trait object. Generic publishing lives in [`EventBusExt`].
pub trait EventBus: Send + Sync {
    /// Write an already-built envelope to the backend.
    ///
    /// # Errors
    ///
    /// Returns the first backend write error ([`EventBusError::Publish`] or
    /// [`EventBusError::Connection`]), or [`EventBusError::Closed`] after shutdown.
    /// Failed writes are never retried by the bus.
    fn publish_envelope(&self, envelope: Envelope) -> BusFuture<'_, ()>;

    /// Register `handler` under `handler_name` for events of `event_type`.
    ///
    /// The first subscription for a type creates that type's consumer and starts
    /// its background reader.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::InvalidEventType`] for an empty type,
    /// [`EventBusError::Closed`] after shutdown, or a provisioning error if the
    /// backend rejects the subscription synchronously.
    fn subscribe(
        &self,
        event_type: &str,
        handler_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusFuture<'_, Subscription>;

    /// Remove a registration and stop its worker.
    ///
    /// The worker finishes the events already queued for it. Removing the last
    /// registration of a type stops that type's consumer. Unknown tokens are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Implementations in this workspace never fail here; the `Result` leaves
    /// room for backends that must release remote resources.
    fn unsubscribe(&self, subscription: &Subscription) -> BusFuture<'_, ()>;

    /// Stop every consumer and worker and wait for their tasks to finish.
    ///
    /// # Errors
    ///
    /// Implementations in this workspace never fail here.
    fn shutdown(&self) -> BusFuture<'_, ()>;
}

/// Convenience methods available on every [`EventBus`].
pub trait EventBusExt: EventBus {
    /// Serialize `payload` into a new envelope of `event_type` and publish it.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Serialization`] if the payload cannot be
    /// serialized, otherwise whatever [`EventBus::publish_envelope`] returns.
    fn publish<'a, T>(&'a self, event_type: &str, payload: &T) -> BusFuture<'a, ()>
    where
        T: Serialize + ?Sized,
    {
        match Envelope::new(event_type, payload) {
            Ok(envelope) => self.publish_envelope(envelope),
            Err(e) => Box::pin(std::future::ready(Err(e))),
        }
    }
}

impl<B: EventBus + ?Sized> EventBusExt for B {}

/// Validate an event type before it is used as a routing key.
///
/// # Errors
///
/// Returns [`EventBusError::InvalidEventType`] for an empty string.
pub fn validate_event_type(event_type: &str) -> Result<()> {
    if event_type.is_empty() {
        return Err(EventBusError::InvalidEventType(event_type.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_event_type_is_rejected() {
        assert_eq!(
            validate_event_type(""),
            Err(EventBusError::InvalidEventType(String::new()))
        );
        assert!(validate_event_type("order.created").is_ok());
    }

    #[test]
    fn subscription_display_includes_all_parts() {
        let sub = Subscription::new(7, "order.created".into(), "billing".into());
        assert_eq!(sub.to_string(), "order.created/billing#7");
    }

    #[test]
    fn error_messages_are_descriptive() {
        let err = EventBusError::Publish {
            event_type: "order.created".into(),
            reason: "broker down".into(),
        };
        assert_eq!(
            err.to_string(),
            "Publish failed for event type 'order.created': broker down"
        );
    }
}
