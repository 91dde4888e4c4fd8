//! # dddbus Testing
//!
//! Testing utilities and helpers for dddbus backends.
//!
//! This crate provides:
//! - Handlers that record what they receive and can be awaited
//! - Handlers that panic on selected events
//! - A fault reporter that collects handler panics
//! - Polling helpers and tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use dddbus_testing::mocks::RecordingHandler;
//! use std::time::Duration;
//!
//! #[tokio::test]
//! async fn billing_receives_orders() {
//!     let bus = InMemoryEventBus::new();
//!     let billing = RecordingHandler::new();
//!     bus.subscribe("order.created", "billing", billing.clone()).await.unwrap();
//!
//!     bus.publish("order.created", &serde_json::json!({ "id": 1 })).await.unwrap();
//!
//!     assert!(billing.wait_for_count(1, Duration::from_secs(1)).await);
//! }
//! ```

use std::time::Duration;

/// Handler and reporter doubles.
pub mod mocks {
    use dddbus_core::handler::HandlerFuture;
    use dddbus_core::{Envelope, EventHandler, FaultReporter, HandlerFault};
    use serde::de::DeserializeOwned;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Handler that records every event it receives.
    #[derive(Default)]
    pub struct RecordingHandler {
        events: Mutex<Vec<Envelope>>,
        notify: Notify,
    }

    impl RecordingHandler {
        /// Create a shareable recorder.
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn record(&self, event: &Envelope) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
            self.notify.notify_waiters();
        }

        /// Events received so far, in arrival order.
        #[must_use]
        pub fn events(&self) -> Vec<Envelope> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Number of events received so far.
        #[must_use]
        pub fn len(&self) -> usize {
            self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        /// Whether no event has been received yet.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Payloads of the received events, decoded as `T`.
        ///
        /// Events whose payload does not decode as `T` are skipped.
        #[must_use]
        pub fn payloads<T: DeserializeOwned>(&self) -> Vec<T> {
            self.events()
                .iter()
                .filter_map(|e| e.payload_as::<T>().ok())
                .collect()
        }

        /// Wait until at least `count` events have arrived.
        ///
        /// Returns `false` if `timeout` elapsed first.
        pub async fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
            tokio::time::timeout(timeout, async {
                loop {
                    let notified = self.notify.notified();
                    if self.len() >= count {
                        return;
                    }
                    notified.await;
                }
            })
            .await
            .is_ok()
        }
    }

    impl EventHandler for RecordingHandler {
        fn handle<'a>(&'a self, event: &'a Envelope) -> HandlerFuture<'a> {
            Box::pin(async move { self.record(event) })
        }
    }

    type Predicate = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

    /// Handler that panics on events matching a predicate and records the rest.
    pub struct PanickingHandler {
        panic_on: Predicate,
        recorder: Arc<RecordingHandler>,
    }

    impl PanickingHandler {
        /// Panic on every event for which `panic_on` returns `true`.
        #[must_use]
        pub fn new<F>(panic_on: F) -> Arc<Self>
        where
            F: Fn(&Envelope) -> bool + Send + Sync + 'static,
        {
            Arc::new(Self {
                panic_on: Box::new(panic_on),
                recorder: RecordingHandler::new(),
            })
        }

        /// Recorder holding the events that did not panic.
        #[must_use]
        pub fn recorder(&self) -> Arc<RecordingHandler> {
            Arc::clone(&self.recorder)
        }
    }

    impl EventHandler for PanickingHandler {
        #[allow(clippy::panic)]
        fn handle<'a>(&'a self, event: &'a Envelope) -> HandlerFuture<'a> {
            Box::pin(async move {
                if (self.panic_on)(event) {
                    panic!("handler failed on event {}", event.id());
                }
                self.recorder.record(event);
            })
        }
    }

    /// Handler that sleeps before recording each event.
    pub struct SlowHandler {
        delay: Duration,
        recorder: Arc<RecordingHandler>,
    }

    impl SlowHandler {
        /// Sleep `delay` per event.
        #[must_use]
        pub fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                recorder: RecordingHandler::new(),
            })
        }

        /// Recorder holding the processed events.
        #[must_use]
        pub fn recorder(&self) -> Arc<RecordingHandler> {
            Arc::clone(&self.recorder)
        }
    }

    impl EventHandler for SlowHandler {
        fn handle<'a>(&'a self, event: &'a Envelope) -> HandlerFuture<'a> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.recorder.record(event);
            })
        }
    }

    /// Fault reporter that keeps every fault for later assertions.
    #[derive(Default)]
    pub struct CollectingFaultReporter {
        faults: Mutex<Vec<HandlerFault>>,
    }

    impl CollectingFaultReporter {
        /// Create a shareable reporter.
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Faults reported so far.
        #[must_use]
        pub fn faults(&self) -> Vec<HandlerFault> {
            self.faults
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl FaultReporter for CollectingFaultReporter {
        fn report(&self, fault: &HandlerFault) {
            self.faults
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(fault.clone());
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use std::time::Duration;

    /// Poll `condition` every 10ms until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition held.
    pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Install a test-friendly `tracing` subscriber (filter from `RUST_LOG`,
    /// default `warn`). Safe to call from every test.
    pub fn init_test_tracing() {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }
}

/// Default time tests wait for asynchronous delivery.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

// Re-export commonly used items
pub use helpers::{init_test_tracing, wait_until};
pub use mocks::{CollectingFaultReporter, PanickingHandler, RecordingHandler, SlowHandler};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use dddbus_core::{Envelope, EventHandler};

    #[tokio::test]
    async fn recorder_wakes_waiters() {
        let recorder = RecordingHandler::new();
        let event = Envelope::new("t", &1).unwrap();

        let waiter = {
            let recorder = recorder.clone();
            tokio::spawn(async move { recorder.wait_for_count(1, DELIVERY_TIMEOUT).await })
        };
        recorder.handle(&event).await;

        assert!(waiter.await.unwrap());
        assert_eq!(recorder.payloads::<i32>(), vec![1]);
    }

    #[tokio::test]
    async fn wait_for_count_times_out() {
        let recorder = RecordingHandler::new();
        assert!(!recorder.wait_for_count(1, std::time::Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn wait_until_observes_condition() {
        let mut calls = 0;
        assert!(wait_until(DELIVERY_TIMEOUT, || {
            calls += 1;
            calls > 2
        })
        .await);
    }
}
