//! Redis Streams event bus for dddbus.
//!
//! Each event type is stored in its own stream, `__event__:<type>`. Publishing
//! appends to the stream with `XADD ... MAXLEN`, so every stream keeps at most
//! the configured number of entries. The first subscription for a type starts a
//! reader task that joins the bus's consumer group on that stream and fans every
//! message out to the handlers registered in this process.
//!
//! ```text
//! publish ──XADD──► __event__:order.created ──XREADGROUP──► reader ──► [worker] ──► handler
//!                                                              │
//!                                                              └─────► [worker] ──► handler
//! ```
//!
//! # Delivery Semantics
//!
//! - Consumer groups: processes sharing a group name split the stream; each
//!   message goes to one reader in the group
//! - Messages are acknowledged (`XACK`) as soon as they are read, before they
//!   reach any handler. A crash after the ack loses the message for this group
//! - Ordering is only guaranteed per handler, within one event type
//!
//! # Example
//!
//! ```no_run
//! use dddbus_core::{EventBus, EventBusExt, handler_fn};
//! use dddbus_redis::RedisEventBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedisEventBus::builder()
//!     .url("redis://127.0.0.1:6379")
//!     .group("billing-service")
//!     .build()
//!     .await?;
//!
//! bus.subscribe("order.created", "billing", handler_fn(|event| {
//!     println!("billing received {event}");
//! }))
//! .await?;
//!
//! bus.publish("order.created", &serde_json::json!({ "id": 1 })).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod reader;

use dddbus_core::backoff::BackoffPolicy;
use dddbus_core::consumer::{ConsumerHandle, ConsumerState};
use dddbus_core::event_bus::{BusFuture, EventBusError, Subscription, validate_event_type};
use dddbus_core::registry::Registry;
use dddbus_core::wire::WireEvent;
use dddbus_core::worker::{DEFAULT_WORKER_QUEUE_CAPACITY, FaultReporter, LogFaultReporter};
use dddbus_core::{Envelope, EventBus, EventHandler, metrics};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use reader::StreamReader;
use std::sync::Arc;
use std::time::Duration;

/// Default consumer group name.
pub const DEFAULT_GROUP: &str = "dddbus";

/// Default `MAXLEN` applied to every stream on publish.
pub const DEFAULT_STREAM_MAX_LEN: usize = 1000;

/// Default `BLOCK` timeout of a single `XREADGROUP` call.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const BACKEND: &str = "redis";

/// Stream key holding events of `event_type`.
#[must_use]
pub fn stream_key(event_type: &str) -> String {
    format!("__event__:{event_type}")
}

/// Settings shared by every reader task of one bus.
#[derive(Debug, Clone)]
pub(crate) struct ReaderConfig {
    pub(crate) group: String,
    pub(crate) block_timeout: Duration,
    pub(crate) backoff: BackoffPolicy,
}

/// Event bus backed by Redis Streams consumer groups.
///
/// Publishing goes through a shared [`ConnectionManager`]. Every reader task
/// opens its own connection because `XREADGROUP ... BLOCK` holds the
/// connection for the length of the block.
pub struct RedisEventBus {
    client: redis::Client,
    publisher: ConnectionManager,
    registry: Arc<Registry>,
    reader_config: Arc<ReaderConfig>,
    stream_max_len: usize,
}

impl RedisEventBus {
    /// Connect to `url` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Connection`] if the URL is invalid or Redis is
    /// unreachable.
    pub async fn new(url: &str) -> Result<Self, EventBusError> {
        Self::builder().url(url).build().await
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedisEventBusBuilder {
        RedisEventBusBuilder::default()
    }

    /// Consumer group this bus reads with.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.reader_config.group
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
}

/// Builder for configuring a [`RedisEventBus`].
///
/// # Example
///
/// ```no_run
/// use dddbus_redis::RedisEventBus;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedisEventBus::builder()
///     .url("redis://127.0.0.1:6379")
///     .group("billing-service")
///     .stream_max_len(10_000)
///     .block_timeout(Duration::from_secs(2))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisEventBusBuilder {
    url: Option<String>,
    client: Option<redis::Client>,
    group: String,
    stream_max_len: usize,
    block_timeout: Duration,
    backoff: BackoffPolicy,
    worker_queue_capacity: usize,
    fault_reporter: Arc<dyn FaultReporter>,
}

impl Default for RedisEventBusBuilder {
    fn default() -> Self {
        Self {
            url: None,
            client: None,
            group: DEFAULT_GROUP.to_string(),
            stream_max_len: DEFAULT_STREAM_MAX_LEN,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            backoff: BackoffPolicy::default(),
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
            fault_reporter: Arc::new(LogFaultReporter),
        }
    }
}

impl RedisEventBusBuilder {
    /// Set the Redis URL (e.g. `redis://:password@host:6379/0`).
    ///
    /// Ignored when a client is supplied with [`client`](Self::client).
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Use an existing client instead of opening one from a URL.
    #[must_use]
    pub fn client(mut self, client: redis::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the consumer group name (default: `dddbus`).
    ///
    /// Processes using the same group share the work on every stream.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Set the `MAXLEN` applied when publishing (default: 1000).
    #[must_use]
    pub const fn stream_max_len(mut self, max_len: usize) -> Self {
        self.stream_max_len = max_len;
        self
    }

    /// Set how long one `XREADGROUP` call blocks (default: 5 seconds).
    ///
    /// This bounds how long a reader waits on Redis before it checks for
    /// cancellation again.
    #[must_use]
    pub const fn block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set the delay policy after transient errors (default: fixed 10 seconds).
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the queue capacity of each handler worker (default: 1000).
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

    /// Build the [`RedisEventBus`] and connect its publisher.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Connection`] if:
    /// - Neither a URL nor a client was configured
    /// - The URL is invalid
    /// - The publisher connection cannot be established
    pub async fn build(self) -> Result<RedisEventBus, EventBusError> {
        let client = match (self.client, self.url) {
            (Some(client), _) => client,
            (None, Some(url)) => redis::Client::open(url.as_str()).map_err(|e| {
                EventBusError::Connection(format!("Invalid Redis URL: {e}"))
            })?,
            (None, None) => {
                return Err(EventBusError::Connection(
                    "Redis URL not configured".to_string(),
                ));
            },
        };

        let publisher = ConnectionManager::new(client.clone()).await.map_err(|e| {
            EventBusError::Connection(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!(
            group = %self.group,
            stream_max_len = self.stream_max_len,
            block_timeout_ms = u64::try_from(self.block_timeout.as_millis()).unwrap_or(u64::MAX),
            worker_queue_capacity = self.worker_queue_capacity,
            "RedisEventBus created successfully"
        );

        Ok(RedisEventBus {
            client,
            publisher,
            registry: Arc::new(Registry::new(self.worker_queue_capacity, self.fault_reporter)),
            reader_config: Arc::new(ReaderConfig {
                group: self.group,
                block_timeout: self.block_timeout,
                backoff: self.backoff,
            }),
            stream_max_len: self.stream_max_len,
        })
    }
}

impl EventBus for RedisEventBus {
    fn publish_envelope(&self, envelope: Envelope) -> BusFuture<'_, ()> {
        Box::pin(async move {
            validate_event_type(envelope.event_type())?;
            if self.registry.is_closed() {
                return Err(EventBusError::Closed);
            }

            let wire = WireEvent::from_envelope(&envelope)?;
            let key = stream_key(envelope.event_type());
            let mut conn = self.publisher.clone();

            let entry_id: String = conn
                .xadd_maxlen(
                    &key,
                    StreamMaxlen::Equals(self.stream_max_len),
                    "*",
                    &wire.to_fields(),
                )
                .await
                .map_err(|e| {
                    tracing::warn!(
                        stream = %key,
                        error = %e,
                        "Failed to publish event"
                    );
                    EventBusError::Publish {
                        event_type: envelope.event_type().to_string(),
                        reason: e.to_string(),
                    }
                })?;

            metrics::record_published(BACKEND, envelope.event_type());
            tracing::debug!(
                stream = %key,
                entry_id = %entry_id,
                event_id = %envelope.id(),
                "Event published"
            );
            Ok(())
        })
    }

    fn subscribe(
        &self,
        event_type: &str,
        handler_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusFuture<'_, Subscription> {
        let event_type = event_type.to_string();
        let handler_name = handler_name.to_string();

        // Registration and reader spawn happen in one poll, so an unpolled
        // future leaves no trace in the registry.
        Box::pin(async move {
            let registered = self.registry.register(&event_type, &handler_name, handler)?;
            if let Some(handle) = registered.new_consumer {
                let reader = StreamReader::new(
                    self.client.clone(),
                    Arc::clone(&self.registry),
                    handle,
                    Arc::clone(&self.reader_config),
                );
                self.registry.spawn(reader.run());
            }
            Ok(registered.subscription)
        })
    }

    fn unsubscribe(&self, subscription: &Subscription) -> BusFuture<'_, ()> {
        // A returned handle is already cancelled; its reader finishes the lifecycle.
        let _ = self.registry.deregister(subscription);
        Box::pin(std::future::ready(Ok(())))
    }

    fn shutdown(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            let stopped = self.registry.shutdown().await;
            tracing::info!(consumers = stopped.len(), "RedisEventBus shut down");
            Ok(())
        })
    }
}
