//! # dddbus Core
//!
//! Core types for the dddbus event bus.
//!
//! This crate holds everything the three backends share:
//!
//! - [`event::Envelope`]: one published event (id, type, time, payload)
//! - [`wire::WireEvent`]: the fixed wire field set used by Redis and Kafka
//! - [`event_bus::EventBus`]: publish / subscribe / unsubscribe / shutdown
//! - [`handler::EventHandler`]: callbacks invoked for each event
//! - [`worker::HandlerWorker`]: per-subscription queue and task with panic isolation
//! - [`registry::Registry`]: event type → type consumer map
//! - [`consumer::ConsumerHandle`]: type consumer lifecycle and cancellation
//! - [`backoff::BackoffPolicy`]: delays between transient failures
//!
//! ## Example
//!
//! ```ignore
//! use dddbus_core::event_bus::{EventBus, EventBusExt};
//! use dddbus_core::handler::handler_fn;
//! use std::sync::Arc;
//!
//! async fn wire_up(bus: Arc<dyn EventBus>) -> dddbus_core::event_bus::Result<()> {
//!     bus.subscribe("order.created", "billing", handler_fn(|event| {
//!         tracing::info!(%event, "billing received order");
//!     }))
//!     .await?;
//!
//!     bus.publish("order.created", &serde_json::json!({ "id": 1 })).await
//! }
//! ```

pub mod backoff;
pub mod consumer;
pub mod event;
pub mod event_bus;
pub mod handler;
pub mod metrics;
pub mod registry;
pub mod wire;
pub mod worker;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use consumer::{ConsumerHandle, ConsumerState};
pub use event::Envelope;
pub use event_bus::{EventBus, EventBusError, EventBusExt, Subscription};
pub use handler::{EventHandler, async_handler_fn, handler_fn};
pub use uuid::Uuid;
pub use worker::{FaultReporter, HandlerFault, LogFaultReporter, capture_panic_backtraces};
