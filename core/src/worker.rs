//! Per-subscription handler workers.
//!
//! ```text
//! fan_out(event)
//!     │
//!     ├──► [queue 1] ──► worker 1 ──► handler 1
//!     │    (bounded)         └──────► panic → FaultReporter
//!     └──► [queue N] ──► worker N ──► handler N
//!          (bounded)
//! ```
//!
//! ## Rules
//! - **Per-handler FIFO**: a worker processes its queue strictly in order
//! - **No cross-handler ordering**: worker A may be on event N while B is on N+5
//! - **Backpressure**: pushing onto a full queue waits for space
//! - **Isolation**: a panicking handler is reported and the worker moves on
//!
//! ## Panic handling
//! The handler future runs inside `catch_unwind`. A panic becomes a
//! [`HandlerFault`] passed to the worker's [`FaultReporter`]. The default
//! reporter logs it at `error` level.
//!
//! The stack at the panic site is gone once `catch_unwind` returns, so the
//! fault only carries a backtrace when the process has called
//! [`capture_panic_backtraces`], which records it from the panic hook.
//!
//! `AssertUnwindSafe` is used, so a handler that panics while holding a lock
//! around shared state can leave that state inconsistent.

use crate::event::Envelope;
use crate::handler::EventHandler;
use crate::metrics;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Default capacity of a handler worker queue.
pub const DEFAULT_WORKER_QUEUE_CAPACITY: usize = 1000;

/// A panic caught inside a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFault {
    /// Event type the handler is subscribed to.
    pub event_type: String,
    /// Name the handler was registered under.
    pub handler_name: String,
    /// Id of the event being handled.
    pub event_id: Uuid,
    /// Panic message, if it was a string.
    pub message: String,
    /// Stack at the panic site, if [`capture_panic_backtraces`] is installed.
    pub backtrace: Option<String>,
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler '{}' panicked on {} event {}: {}",
            self.handler_name, self.event_type, self.event_id, self.message
        )
    }
}

/// Hook receiving every caught handler panic.
pub trait FaultReporter: Send + Sync + 'static {
    /// Called on the worker task after the panic has been caught.
    fn report(&self, fault: &HandlerFault);
}

/// Reports faults through `tracing`.
///
/// The backtrace field is empty unless the binary called
/// [`capture_panic_backtraces`] at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFaultReporter;

impl FaultReporter for LogFaultReporter {
    fn report(&self, fault: &HandlerFault) {
        tracing::error!(
            event_type = %fault.event_type,
            handler = %fault.handler_name,
            event_id = %fault.event_id,
            panic = %fault.message,
            backtrace = fault.backtrace.as_deref(),
            "Handler panicked while processing event"
        );
    }
}

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Install a process panic hook that records the backtrace of each panic so
/// [`HandlerFault::backtrace`] holds the stack of the failing handler.
///
/// The previously installed hook still runs. Calling this more than once has
/// no further effect.
pub fn capture_panic_backtraces() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

/// The hook runs on the panicking thread, which is the thread polling the
/// handler, so the slot is read right after `catch_unwind` returns.
fn take_panic_backtrace() -> Option<String> {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

/// Sending side of a worker queue, used by consumers to fan events out.
pub type WorkerSender = mpsc::Sender<Arc<Envelope>>;

/// A running handler worker.
///
/// Dropping or [stopping](HandlerWorker::stop) the worker closes its queue once
/// every in-flight sender clone is gone; the task then finishes the queued
/// events and exits.
pub struct HandlerWorker {
    handler_name: String,
    sender: WorkerSender,
}

impl HandlerWorker {
    /// Spawn a worker task on `tracker`.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn spawn(
        tracker: &TaskTracker,
        event_type: &str,
        handler_name: &str,
        handler: Arc<dyn EventHandler>,
        capacity: usize,
        reporter: Arc<dyn FaultReporter>,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Arc<Envelope>>(capacity.max(1));
        let event_type = event_type.to_string();
        let name = handler_name.to_string();

        tracker.spawn(async move {
            while let Some(event) = receiver.recv().await {
                let outcome = AssertUnwindSafe(async { handler.handle(&event).await })
                    .catch_unwind()
                    .await;

                if let Err(panic) = outcome {
                    let backtrace = take_panic_backtrace();
                    let fault = HandlerFault {
                        event_type: event_type.clone(),
                        handler_name: name.clone(),
                        event_id: event.id(),
                        message: panic_message(panic.as_ref()),
                        backtrace,
                    };
                    metrics::record_handler_fault(&event_type);
                    reporter.report(&fault);
                }
            }

            tracing::debug!(event_type = %event_type, handler = %name, "Handler worker exiting");
        });

        Self {
            handler_name: handler_name.to_string(),
            sender,
        }
    }

    /// Name the handler was registered under.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// A sender onto this worker's queue.
    #[must_use]
    pub fn sender(&self) -> WorkerSender {
        self.sender.clone()
    }

    /// Close the queue. Queued events are still processed.
    pub fn stop(self) {
        tracing::debug!(handler = %self.handler_name, "Stopping handler worker");
        drop(self.sender);
    }
}

impl fmt::Debug for HandlerWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerWorker")
            .field("handler_name", &self.handler_name)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// Push `event` onto every queue in `senders`, in order.
///
/// Waits while a queue is full. Queues whose worker is gone are skipped.
/// Returns the number of queues the event was pushed onto.
pub async fn fan_out(senders: &[WorkerSender], event: Arc<Envelope>) -> usize {
    let mut delivered = 0;
    for sender in senders {
        if sender.send(Arc::clone(&event)).await.is_ok() {
            delivered += 1;
        }
    }
    metrics::record_delivered(event.event_type(), delivered);
    delivered
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
