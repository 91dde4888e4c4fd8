//! The event type → type consumer registry shared by every backend.
//!
//! One registry-wide `RwLock` guards the map. Subscribe and unsubscribe take it
//! for writing; consumers take it for reading to snapshot the worker queues of
//! their type. The lock is never held across an `.await`: readers clone the
//! queue senders and release the lock before pushing events.
//!
//! Every background task (handler workers, reader loops, dispatchers) is
//! spawned on the registry's [`TaskTracker`] so [`Registry::shutdown`] can wait
//! for all of them.

use crate::consumer::{ConsumerHandle, ConsumerState};
use crate::event_bus::{EventBusError, Result, Subscription, validate_event_type};
use crate::handler::EventHandler;
use crate::worker::{
    DEFAULT_WORKER_QUEUE_CAPACITY, FaultReporter, HandlerWorker, LogFaultReporter, WorkerSender,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::task::TaskTracker;

struct TypeConsumer {
    handle: ConsumerHandle,
    workers: Vec<(u64, HandlerWorker)>,
}

/// Outcome of [`Registry::register`].
#[derive(Debug)]
pub struct Registered {
    /// Token for the new registration.
    pub subscription: Subscription,
    /// Set when this registration created the type's consumer; the backend must
    /// start its reader.
    pub new_consumer: Option<ConsumerHandle>,
}

/// Registry of type consumers and their handler workers.
pub struct Registry {
    consumers: RwLock<HashMap<String, TypeConsumer>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    worker_capacity: usize,
    reporter: Arc<dyn FaultReporter>,
    tracker: TaskTracker,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_QUEUE_CAPACITY, Arc::new(LogFaultReporter))
    }
}

impl Registry {
    /// Create an empty registry.
    ///
    /// `worker_capacity` is the queue size of every handler worker it spawns.
    #[must_use]
    pub fn new(worker_capacity: usize, reporter: Arc<dyn FaultReporter>) -> Self {
        Self {
            consumers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            worker_capacity,
            reporter,
            tracker: TaskTracker::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TypeConsumer>> {
        self.consumers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TypeConsumer>> {
        self.consumers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a handler worker for `event_type`, creating the type's consumer if
    /// this is the first registration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::InvalidEventType`] for an empty type and
    /// [`EventBusError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn register(
        &self,
        event_type: &str,
        handler_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Registered> {
        validate_event_type(event_type)?;

        let mut consumers = self.write();
        if self.is_closed() {
            return Err(EventBusError::Closed);
        }

        let mut new_consumer = None;
        let consumer = consumers.entry(event_type.to_string()).or_insert_with(|| {
            let handle = ConsumerHandle::new(self.next_id(), event_type);
            new_consumer = Some(handle.clone());
            TypeConsumer {
                handle,
                workers: Vec::new(),
            }
        });

        let id = self.next_id();
        let worker = HandlerWorker::spawn(
            &self.tracker,
            event_type,
            handler_name,
            handler,
            self.worker_capacity,
            Arc::clone(&self.reporter),
        );
        consumer.workers.push((id, worker));

        tracing::debug!(
            event_type = %event_type,
            handler = %handler_name,
            subscription_id = id,
            handlers = consumer.workers.len(),
            new_consumer = new_consumer.is_some(),
            "Registered handler"
        );

        Ok(Registered {
            subscription: Subscription::new(id, event_type.to_string(), handler_name.to_string()),
            new_consumer,
        })
    }

    /// Remove a registration and stop its worker.
    ///
    /// If it was the last registration of its type, the consumer is removed,
    /// cancelled and returned. Unknown subscriptions are ignored.
    pub fn deregister(&self, subscription: &Subscription) -> Option<ConsumerHandle> {
        let mut consumers = self.write();
        let consumer = consumers.get_mut(subscription.event_type())?;

        if let Some(pos) = consumer
            .workers
            .iter()
            .position(|(id, _)| *id == subscription.id())
        {
            let (_, worker) = consumer.workers.remove(pos);
            worker.stop();
            tracing::debug!(
                event_type = %subscription.event_type(),
                handler = %subscription.handler_name(),
                subscription_id = subscription.id(),
                "Deregistered handler"
            );
        }

        if !consumer.workers.is_empty() {
            return None;
        }

        let consumer = consumers.remove(subscription.event_type())?;
        consumer.handle.cancel();
        tracing::debug!(
            event_type = %subscription.event_type(),
            "Last handler removed, stopping type consumer"
        );
        Some(consumer.handle)
    }

    /// Snapshot the worker queues currently registered for `event_type`.
    #[must_use]
    pub fn senders(&self, event_type: &str) -> Vec<WorkerSender> {
        self.read()
            .get(event_type)
            .map(|c| c.workers.iter().map(|(_, w)| w.sender()).collect())
            .unwrap_or_default()
    }

    /// Snapshot the worker queues of the consumer behind `handle`.
    ///
    /// Returns `None` once that consumer has no handlers left, including when
    /// it has been replaced by a newer consumer for the same type.
    #[must_use]
    pub fn senders_for(&self, handle: &ConsumerHandle) -> Option<Vec<WorkerSender>> {
        let consumers = self.read();
        let consumer = consumers.get(handle.event_type())?;
        if consumer.handle.id() != handle.id() || consumer.workers.is_empty() {
            return None;
        }
        Some(consumer.workers.iter().map(|(_, w)| w.sender()).collect())
    }

    /// Handle of the consumer currently registered for `event_type`.
    #[must_use]
    pub fn consumer(&self, event_type: &str) -> Option<ConsumerHandle> {
        self.read().get(event_type).map(|c| c.handle.clone())
    }

    /// Lifecycle state of the consumer for `event_type`.
    #[must_use]
    pub fn consumer_state(&self, event_type: &str) -> ConsumerState {
        self.read()
            .get(event_type)
            .map_or(ConsumerState::Absent, |c| c.handle.state())
    }

    /// Event types with at least one registration, sorted.
    #[must_use]
    pub fn subscribed_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of handlers registered for `event_type`.
    #[must_use]
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.read().get(event_type).map_or(0, |c| c.workers.len())
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawn a background task that [`shutdown`](Self::shutdown) will wait for.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Close the registry: reject new registrations, stop every worker, cancel
    /// every consumer and wait for all tracked tasks.
    ///
    /// Returns the handles of the consumers that were removed.
    pub async fn shutdown(&self) -> Vec<ConsumerHandle> {
        let retired: Vec<ConsumerHandle> = {
            let mut consumers = self.write();
            self.closed.store(true, Ordering::Release);
            consumers
                .drain()
                .map(|(_, consumer)| {
                    for (_, worker) in consumer.workers {
                        worker.stop();
                    }
                    consumer.handle.cancel();
                    consumer.handle
                })
                .collect()
        };

        self.tracker.close();
        self.tracker.wait().await;
        retired
    }
}
