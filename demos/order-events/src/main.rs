//! Order events demo.
//!
//! Subscribes a billing and a shipping handler to `order.created`, publishes a
//! few orders and shuts the bus down. One order makes the shipping handler
//! panic; billing keeps going and shipping handles the next order.
//!
//! # Usage
//!
//! ```bash
//! # In-process bus
//! cargo run --bin order-events
//!
//! # Redis Streams
//! EVENT_BUS_BACKEND=redis REDIS_URL=redis://127.0.0.1:6379 cargo run --bin order-events
//!
//! # Kafka
//! EVENT_BUS_BACKEND=kafka KAFKA_BROKERS=localhost:9092 cargo run --bin order-events
//! ```
//!
//! `EVENT_BUS_GROUP` sets the consumer group, `RUST_LOG` the log filter.

mod config;

use anyhow::Context;
use config::{Backend, Config};
use dddbus_core::{EventBus, EventBusExt, capture_panic_backtraces, handler_fn};
use dddbus_kafka::KafkaEventBus;
use dddbus_memory::InMemoryEventBus;
use dddbus_redis::RedisEventBus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ORDER_CREATED: &str = "order.created";

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    id: u64,
    customer: String,
    total_cents: u64,
}

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn EventBus>> {
    let bus: Arc<dyn EventBus> = match &config.backend {
        Backend::Memory => Arc::new(InMemoryEventBus::new()),
        Backend::Redis { url } => Arc::new(
            RedisEventBus::builder()
                .url(url.as_str())
                .group(config.group.as_str())
                .build()
                .await
                .with_context(|| format!("connecting to Redis at {url}"))?,
        ),
        Backend::Kafka { brokers } => Arc::new(
            KafkaEventBus::builder()
                .brokers(brokers.as_str())
                .consumer_group(config.group.as_str())
                .build()
                .with_context(|| format!("creating Kafka producer for {brokers}"))?,
        ),
    };
    Ok(bus)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    capture_panic_backtraces();

    let config = Config::from_env()?;
    info!(backend = ?config.backend, group = %config.group, "Starting order events demo");

    let bus = connect(&config).await?;

    let billing = bus
        .subscribe(
            ORDER_CREATED,
            "billing",
            handler_fn(|event| match event.payload_as::<OrderCreated>() {
                Ok(order) => info!(
                    order_id = order.id,
                    customer = %order.customer,
                    total_cents = order.total_cents,
                    "Billing order"
                ),
                Err(e) => tracing::warn!(event = %event, error = %e, "Billing got an unreadable order"),
            }),
        )
        .await?;

    #[allow(clippy::panic)]
    let shipping = bus
        .subscribe(
            ORDER_CREATED,
            "shipping",
            handler_fn(|event| {
                let order: Option<OrderCreated> = event.payload_as().ok();
                match order {
                    Some(order) if order.customer.is_empty() => {
                        panic!("order {} has no shipping address", order.id);
                    },
                    Some(order) => info!(order_id = order.id, "Shipping order"),
                    None => tracing::warn!(event = %event, "Shipping got an unreadable order"),
                }
            }),
        )
        .await?;

    let orders = [
        OrderCreated { id: 1, customer: "alice".to_string(), total_cents: 4_200 },
        OrderCreated { id: 2, customer: String::new(), total_cents: 999 },
        OrderCreated { id: 3, customer: "bob".to_string(), total_cents: 15_000 },
    ];
    for order in &orders {
        bus.publish(ORDER_CREATED, order).await?;
        info!(order_id = order.id, "Published order");
    }

    // Give remote backends time to deliver.
    tokio::time::sleep(Duration::from_secs(match config.backend {
        Backend::Memory => 1,
        Backend::Redis { .. } => 3,
        Backend::Kafka { .. } => 15,
    }))
    .await;

    bus.unsubscribe(&shipping).await?;
    bus.unsubscribe(&billing).await?;
    bus.shutdown().await?;
    info!("Demo finished");
    Ok(())
}
