//! Kafka event bus for dddbus.
//!
//! Each event type gets its own topic, `__event__.<type>`. Events are written
//! by one long-lived producer as JSON records keyed by event id. The first
//! subscription for a type starts a reader task that makes sure the topic
//! exists, joins the bus's consumer group and fans every record out to the
//! handlers registered in this process.
//!
//! ```text
//! publish ──► FutureProducer ──► __event__.order.created ──► StreamConsumer ──► [worker] ──► handler
//!                                                                   │
//!                                                                   └─────────► [worker] ──► handler
//! ```
//!
//! # Delivery Semantics
//!
//! **At-most-once per consumer group** with manual offset commits:
//! - Offsets are committed as soon as a record is received, before any
//!   handler runs. A crash after the commit loses the record for this group
//! - Records of one type are read by one reader per process; ordering holds
//!   within a partition and per handler
//! - Processes sharing a group split the partitions of each topic
//!
//! # Example
//!
//! ```no_run
//! use dddbus_core::{EventBus, EventBusExt, handler_fn};
//! use dddbus_kafka::KafkaEventBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = KafkaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("billing-service")
//!     .build()?;
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
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use reader::TopicReader;
use std::sync::Arc;
use std::time::Duration;

/// Default consumer group.
pub const DEFAULT_GROUP: &str = "dddbus";

pub(crate) const BACKEND: &str = "kafka";

/// Topic holding events of `event_type`.
#[must_use]
pub fn topic_name(event_type: &str) -> String {
    format!("__event__.{event_type}")
}

/// Settings shared by every reader task of one bus.
#[derive(Debug, Clone)]
pub(crate) struct ReaderConfig {
    pub(crate) brokers: String,
    pub(crate) group: String,
    pub(crate) auto_offset_reset: String,
    pub(crate) topic_partitions: i32,
    pub(crate) topic_replication: i32,
    pub(crate) provisioning_timeout: Duration,
    pub(crate) backoff: BackoffPolicy,
}

/// Kafka event bus implementation.
///
/// Works against any Kafka-compatible broker (Apache Kafka, Redpanda, MSK).
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Consumer group**: Shared by every reader of this bus (default: `dddbus`)
/// - **Offset reset**: Where a new group starts reading (default: `earliest`)
/// - **Provisioned topics**: Partition count and replication factor used when
///   a reader creates its topic
pub struct KafkaEventBus {
    /// Kafka producer for publishing events
    producer: FutureProducer,
    /// Producer timeout
    timeout: Duration,
    registry: Arc<Registry>,
    reader_config: Arc<ReaderConfig>,
}

impl KafkaEventBus {
    /// Create a Kafka event bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Connection`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> KafkaEventBusBuilder {
        KafkaEventBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.reader_config.brokers
    }

    /// Consumer group this bus reads with.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
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

/// Builder for configuring a [`KafkaEventBus`].
///
/// # Example
///
/// ```no_run
/// use dddbus_kafka::KafkaEventBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let event_bus = KafkaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .topic_partitions(6)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct KafkaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    topic_partitions: Option<i32>,
    topic_replication: Option<i32>,
    provisioning_timeout: Option<Duration>,
    backoff: BackoffPolicy,
    worker_queue_capacity: usize,
    fault_reporter: Arc<dyn FaultReporter>,
}

impl Default for KafkaEventBusBuilder {
    fn default() -> Self {
        Self {
            brokers: None,
            producer_acks: None,
            compression: None,
            timeout: None,
            consumer_group: None,
            auto_offset_reset: None,
            topic_partitions: None,
            topic_replication: None,
            provisioning_timeout: None,
            backoff: BackoffPolicy::default(),
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
            fault_reporter: Arc::new(LogFaultReporter),
        }
    }
}

impl KafkaEventBusBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode.
    ///
    /// - `acks`: "0" (no acks), "1" (leader ack), "all" (all replicas ack)
    ///
    /// Default: "1"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group ID shared by every reader of this bus.
    ///
    /// Instances of a service using the same group split the work.
    ///
    /// Default: `dddbus`
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set where a new consumer group starts reading: `"earliest"`,
    /// `"latest"` or `"error"`.
    ///
    /// Default: `"earliest"`, so events published before the first subscribe
    /// of a group are still delivered.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the partition count of topics created by readers.
    ///
    /// Default: 1
    #[must_use]
    pub const fn topic_partitions(mut self, partitions: i32) -> Self {
        self.topic_partitions = Some(partitions);
        self
    }

    /// Set the replication factor of topics created by readers.
    ///
    /// Default: 1
    #[must_use]
    pub const fn topic_replication(mut self, replication: i32) -> Self {
        self.topic_replication = Some(replication);
        self
    }

    /// Set how long a reader waits for topic creation before it backs off and
    /// tries again.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub const fn provisioning_timeout(mut self, timeout: Duration) -> Self {
        self.provisioning_timeout = Some(timeout);
        self
    }

    /// Set the delay policy after provisioning and read errors (default: fixed
    /// 10 seconds).
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

    /// Build the [`KafkaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Connection`] if:
    /// - Brokers not set
    /// - Cannot create producer
    /// - Invalid configuration
    pub fn build(self) -> Result<KafkaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::Connection("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("1");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| EventBusError::Connection(format!("Failed to create producer: {e}")))?;

        let reader_config = ReaderConfig {
            brokers,
            group: self.consumer_group.unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            topic_partitions: self.topic_partitions.unwrap_or(1),
            topic_replication: self.topic_replication.unwrap_or(1),
            provisioning_timeout: self.provisioning_timeout.unwrap_or(Duration::from_secs(10)),
            backoff: self.backoff,
        };

        tracing::info!(
            brokers = %reader_config.brokers,
            acks,
            compression,
            consumer_group = %reader_config.group,
            auto_offset_reset = %reader_config.auto_offset_reset,
            worker_queue_capacity = self.worker_queue_capacity,
            "KafkaEventBus created successfully"
        );

        Ok(KafkaEventBus {
            producer,
            timeout,
            registry: Arc::new(Registry::new(self.worker_queue_capacity, self.fault_reporter)),
            reader_config: Arc::new(reader_config),
        })
    }
}

impl EventBus for KafkaEventBus {
    fn publish_envelope(&self, envelope: Envelope) -> BusFuture<'_, ()> {
        Box::pin(async move {
            validate_event_type(envelope.event_type())?;
            if self.registry.is_closed() {
                return Err(EventBusError::Closed);
            }

            let topic = topic_name(envelope.event_type());
            let payload = WireEvent::from_envelope(&envelope)?.to_json()?;
            let key = envelope.id().to_string();

            let record = FutureRecord::to(&topic).payload(&payload).key(&key);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    metrics::record_published(BACKEND, envelope.event_type());
                    tracing::debug!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        event_id = %envelope.id(),
                        "Event published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::warn!(
                        topic = %topic,
                        error = %kafka_error,
                        "Failed to publish event"
                    );
                    Err(EventBusError::Publish {
                        event_type: envelope.event_type().to_string(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
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
                let reader = TopicReader::new(
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
            tracing::info!(consumers = stopped.len(), "KafkaEventBus shut down");
            Ok(())
        })
    }
}
