//! In-process event bus for dddbus.
//!
//! [`InMemoryEventBus`] keeps everything inside the current process: a single
//! bounded dispatch queue shared by all publishers and one dispatcher task that
//! drains it in FIFO order, pushing each event onto the queue of every handler
//! registered for its type.
//!
//! ```text
//! publish ──► [dispatch queue] ──► dispatcher ──► [worker queue] ──► handler
//!  (waits when full)                   │
//!                                      └────────► [worker queue] ──► handler
//!                                  (waits when a worker queue is full)
//! ```
//!
//! # Backpressure
//!
//! The dispatcher waits when a handler's queue is full. While it waits, no
//! event of any type is dispatched, and publishers wait once the dispatch
//! queue fills up. A slow handler therefore slows the whole bus down instead
//! of events being dropped.
//!
//! # Example
//!
//! ```no_run
//! use dddbus_core::{EventBus, EventBusExt, handler_fn};
//! use dddbus_memory::InMemoryEventBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = InMemoryEventBus::new();
//!
//! let subscription = bus
//!     .subscribe("order.created", "billing", handler_fn(|event| {
//!         println!("billing received {event}");
//!     }))
//!     .await?;
//!
//! bus.publish("order.created", &serde_json::json!({ "id": 1 })).await?;
//!
//! bus.unsubscribe(&subscription).await?;
//! bus.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use dddbus_core::consumer::{ConsumerHandle, ConsumerState};
use dddbus_core::event_bus::{BusFuture, EventBusError, Subscription, validate_event_type};
use dddbus_core::registry::Registry;
use dddbus_core::worker::{FaultReporter, LogFaultReporter, fan_out};
use dddbus_core::{Envelope, EventBus, EventHandler, metrics};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Default capacity of the shared dispatch queue.
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Default queue capacity of each handler worker.
pub const DEFAULT_HANDLER_BUFFER_SIZE: usize = 100;

const BACKEND: &str = "memory";

/// Event bus backed by an in-process queue.
pub struct InMemoryEventBus {
    /// Dispatch queue; `None` after shutdown
    sender: Mutex<Option<mpsc::Sender<Arc<Envelope>>>>,
    registry: Arc<Registry>,
}

impl InMemoryEventBus {
    /// Create a bus with default settings and start its dispatcher.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a new builder for configuring the bus.
    #[must_use]
    pub fn builder() -> InMemoryEventBusBuilder {
        InMemoryEventBusBuilder::default()
    }

    /// Event types with at least one handler.
    #[must_use]
    pub fn subscribed_types(&self) -> Vec<String> {
        self.registry.subscribed_types()
    }

    /// Number of handlers registered for `event_type`.
    #[must_use]
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.registry.handler_count(event_type)
    }

    /// Lifecycle state of the consumer for `event_type`.
    #[must_use]
    pub fn consumer_state(&self, event_type: &str) -> ConsumerState {
        self.registry.consumer_state(event_type)
    }

    /// Handle of the consumer for `event_type`, if any.
    #[must_use]
    pub fn consumer(&self, event_type: &str) -> Option<ConsumerHandle> {
        self.registry.consumer(event_type)
    }

    fn dispatch_sender(&self) -> Option<mpsc::Sender<Arc<Envelope>>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for configuring an [`InMemoryEventBus`].
pub struct InMemoryEventBusBuilder {
    buffer_size: usize,
    worker_queue_capacity: usize,
    fault_reporter: Arc<dyn FaultReporter>,
}

impl Default for InMemoryEventBusBuilder {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            worker_queue_capacity: DEFAULT_HANDLER_BUFFER_SIZE,
            fault_reporter: Arc::new(LogFaultReporter),
        }
    }
}

impl InMemoryEventBusBuilder {
    /// Set the capacity of the shared dispatch queue (default: 100, minimum 1).
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the queue capacity of each handler worker (default: 100, minimum 1).
    #[must_use]
    pub const fn worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity;
        self
    }

    /// Set the hook that receives handler panics (default: log them).
    #[must_use]
    pub fn fault_reporter(mut self, reporter: Arc<dyn FaultReporter>) -> Self {
        self.fault_reporter = reporter;
        self
    }

    /// Build the bus and start its dispatcher task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> InMemoryEventBus {
        let registry = Arc::new(Registry::new(self.worker_queue_capacity, self.fault_reporter));
        let (sender, receiver) = mpsc::channel(self.buffer_size.max(1));

        registry.spawn(dispatch(Arc::clone(&registry), receiver));

        tracing::info!(
            buffer_size = self.buffer_size,
            worker_queue_capacity = self.worker_queue_capacity,
            "InMemoryEventBus started"
        );

        InMemoryEventBus {
            sender: Mutex::new(Some(sender)),
            registry,
        }
    }
}

/// Drain the dispatch queue until every sender is gone.
async fn dispatch(registry: Arc<Registry>, mut receiver: mpsc::Receiver<Arc<Envelope>>) {
    while let Some(event) = receiver.recv().await {
        tracing::trace!(event_id = %event.id(), event_type = %event.event_type(), "Dispatching event");
        let senders = registry.senders(event.event_type());
        if senders.is_empty() {
            continue;
        }
        fan_out(&senders, event).await;
    }
    tracing::debug!("Dispatcher exiting");
}

impl EventBus for InMemoryEventBus {
    fn publish_envelope(&self, envelope: Envelope) -> BusFuture<'_, ()> {
        let sender = self.dispatch_sender();

        Box::pin(async move {
            validate_event_type(envelope.event_type())?;
            let sender = sender.ok_or(EventBusError::Closed)?;
            let event_type = envelope.event_type().to_string();

            sender
                .send(Arc::new(envelope))
                .await
                .map_err(|_| EventBusError::Closed)?;

            metrics::record_published(BACKEND, &event_type);
            tracing::debug!(event_type = %event_type, "Event published");
            Ok(())
        })
    }

    fn subscribe(
        &self,
        event_type: &str,
        handler_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusFuture<'_, Subscription> {
        // Register eagerly so the subscription exists once this call returns.
        let subscribed = self
            .registry
            .register(event_type, handler_name, handler)
            .map(|registered| {
                if let Some(handle) = registered.new_consumer {
                    // No reader task: the shared dispatcher serves every type.
                    handle.advance(ConsumerState::Active);
                }
                registered.subscription
            });

        Box::pin(std::future::ready(subscribed))
    }

    fn unsubscribe(&self, subscription: &Subscription) -> BusFuture<'_, ()> {
        if let Some(handle) = self.registry.deregister(subscription) {
            handle.retire();
        }
        Box::pin(std::future::ready(Ok(())))
    }

    fn shutdown(&self) -> BusFuture<'_, ()> {
        // Dropping the last dispatch sender lets the dispatcher drain and exit.
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        Box::pin(async move {
            for handle in self.registry.shutdown().await {
                handle.retire();
            }
            tracing::info!("InMemoryEventBus shut down");
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use dddbus_core::EventBusExt;
    use dddbus_core::handler::handler_fn;

    #[test]
    fn in_memory_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<InMemoryEventBus>();
        assert_sync::<InMemoryEventBus>();
    }

    #[test]
    fn builder_defaults_match_dispatch_buffer() {
        let builder = InMemoryEventBus::builder();
        assert_eq!(builder.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(builder.worker_queue_capacity, 100);
    }

    #[tokio::test]
    async fn consumer_is_active_after_subscribe() {
        let bus = InMemoryEventBus::new();
        bus.subscribe("t", "h", handler_fn(|_| {})).await.unwrap();

        assert_eq!(bus.consumer_state("t"), ConsumerState::Active);
        assert_eq!(bus.consumer_state("other"), ConsumerState::Absent);
    }

    #[tokio::test]
    async fn subscribe_takes_effect_before_the_future_is_polled() {
        let bus = InMemoryEventBus::new();
        drop(bus.subscribe("t", "h", handler_fn(|_| {})));

        assert_eq!(bus.handler_count("t"), 1);
        assert_eq!(bus.consumer_state("t"), ConsumerState::Active);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InMemoryEventBus::new();
        assert!(bus.publish("nobody.listens", &1).await.is_ok());
    }

    #[tokio::test]
    async fn publish_rejects_empty_type() {
        let bus = InMemoryEventBus::new();
        let err = bus.publish("", &1).await.unwrap_err();
        assert!(matches!(err, EventBusError::InvalidEventType(_)));
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish_and_subscribe() {
        let bus = InMemoryEventBus::new();
        bus.shutdown().await.unwrap();

        assert_eq!(bus.publish("t", &1).await, Err(EventBusError::Closed));
        assert!(matches!(
            bus.subscribe("t", "h", handler_fn(|_| {})).await,
            Err(EventBusError::Closed)
        ));
    }
}
