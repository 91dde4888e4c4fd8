//! Event handlers invoked by handler workers.
//!
//! Implement [`EventHandler`] directly for stateful handlers, or wrap a closure
//! with [`handler_fn`] (synchronous) or [`async_handler_fn`] (returns a future).

use crate::event::Envelope;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by [`EventHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Callback registered with [`EventBus::subscribe`](crate::event_bus::EventBus::subscribe).
///
/// Handlers do not return errors: a handler that cannot process an event should
/// log and return. A panic is caught by the worker and reported through its
/// [`FaultReporter`](crate::worker::FaultReporter).
pub trait EventHandler: Send + Sync + 'static {
    /// Process one event.
    fn handle<'a>(&'a self, event: &'a Envelope) -> HandlerFuture<'a>;
}

/// Adapter for synchronous closures. See [`handler_fn`].
pub struct FnHandler<F>(F);

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Envelope) + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, event: &'a Envelope) -> HandlerFuture<'a> {
        // Run inside the future so a panic surfaces while the worker polls it.
        Box::pin(async move { (self.0)(event) })
    }
}

/// Adapter for closures returning a future. See [`async_handler_fn`].
pub struct AsyncFnHandler<F>(F);

impl<F, Fut> EventHandler for AsyncFnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle<'a>(&'a self, event: &'a Envelope) -> HandlerFuture<'a> {
        Box::pin(async move { (self.0)(event.clone()).await })
    }
}

/// Wrap a synchronous closure as a shareable handler.
///
/// ```
/// use dddbus_core::handler::handler_fn;
///
/// let handler = handler_fn(|event| println!("got {event}"));
/// # let _ = handler;
/// ```
#[must_use]
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Envelope) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wrap a closure returning a future as a shareable handler.
///
/// The closure receives an owned clone of the envelope so the future can be
/// `'static`.
#[must_use]
pub fn async_handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(AsyncFnHandler(f))
}
