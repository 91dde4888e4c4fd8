//! Integration tests for [`InMemoryEventBus`].
//!
//! Covers delivery, per-handler ordering, unsubscribe behaviour, consumer
//! lifecycle, panic isolation and concurrent registration.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use dddbus_core::{ConsumerState, EventBus, EventBusExt, Subscription, handler_fn};
use dddbus_memory::InMemoryEventBus;
use dddbus_testing::{
    CollectingFaultReporter, DELIVERY_TIMEOUT, PanickingHandler, RecordingHandler, SlowHandler,
    init_test_tracing, wait_until,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCreated {
    id: u64,
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn subscriber_receives_published_order() {
    init_test_tracing();
    let bus = InMemoryEventBus::new();
    let billing = RecordingHandler::new();
    bus.subscribe("order.created", "billing", billing.clone())
        .await
        .unwrap();

    bus.publish("order.created", &serde_json::json!({ "id": 1 }))
        .await
        .unwrap();

    assert!(billing.wait_for_count(1, DELIVERY_TIMEOUT).await);
    // Nothing else shows up afterwards.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = billing.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type(), "order.created");
    assert_eq!(
        events[0].payload_as::<serde_json::Value>().unwrap(),
        serde_json::json!({ "id": 1 })
    );
}

#[tokio::test]
async fn events_are_routed_by_type() {
    let bus = InMemoryEventBus::new();
    let orders = RecordingHandler::new();
    let payments = RecordingHandler::new();
    bus.subscribe("order.created", "orders", orders.clone()).await.unwrap();
    bus.subscribe("payment.received", "payments", payments.clone())
        .await
        .unwrap();

    bus.publish("order.created", &OrderCreated { id: 1 }).await.unwrap();
    bus.publish("payment.received", &"p-1").await.unwrap();
    bus.publish("order.created", &OrderCreated { id: 2 }).await.unwrap();

    assert!(orders.wait_for_count(2, DELIVERY_TIMEOUT).await);
    assert!(payments.wait_for_count(1, DELIVERY_TIMEOUT).await);
    assert_eq!(
        orders.payloads::<OrderCreated>(),
        vec![OrderCreated { id: 1 }, OrderCreated { id: 2 }]
    );
    assert_eq!(payments.payloads::<String>(), vec!["p-1".to_string()]);
}

#[tokio::test]
async fn duplicate_subscription_creates_two_workers() {
    let bus = InMemoryEventBus::new();
    let recorder = RecordingHandler::new();

    let first = bus
        .subscribe("order.created", "billing", recorder.clone())
        .await
        .unwrap();
    let second = bus
        .subscribe("order.created", "billing", recorder.clone())
        .await
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(bus.handler_count("order.created"), 2);

    for id in 0..3 {
        bus.publish("order.created", &OrderCreated { id }).await.unwrap();
    }

    // Every event reaches both workers.
    assert!(recorder.wait_for_count(6, DELIVERY_TIMEOUT).await);
    let mut ids: Vec<u64> = recorder.payloads::<OrderCreated>().iter().map(|o| o.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 0, 1, 1, 2, 2]);
}

#[tokio::test]
async fn async_handlers_are_supported() {
    let bus = InMemoryEventBus::new();
    let recorder = RecordingHandler::new();
    let sink = recorder.clone();
    bus.subscribe(
        "order.created",
        "async",
        dddbus_core::async_handler_fn(move |event| {
            let sink = sink.clone();
            async move {
                tokio::task::yield_now().await;
                dddbus_core::EventHandler::handle(sink.as_ref(), &event).await;
            }
        }),
    )
    .await
    .unwrap();

    bus.publish("order.created", &OrderCreated { id: 9 }).await.unwrap();

    assert!(recorder.wait_for_count(1, DELIVERY_TIMEOUT).await);
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn each_handler_sees_events_in_publish_order() {
    let bus = InMemoryEventBus::builder()
        .buffer_size(4)
        .worker_queue_capacity(2)
        .build();
    let fast = RecordingHandler::new();
    let slow = SlowHandler::new(Duration::from_millis(1));
    bus.subscribe("counter", "fast", fast.clone()).await.unwrap();
    bus.subscribe("counter", "slow", slow.clone()).await.unwrap();

    for n in 0..50u32 {
        bus.publish("counter", &n).await.unwrap();
    }

    assert!(fast.wait_for_count(50, DELIVERY_TIMEOUT).await);
    assert!(slow.recorder().wait_for_count(50, DELIVERY_TIMEOUT).await);
    let expected: Vec<u32> = (0..50).collect();
    assert_eq!(fast.payloads::<u32>(), expected);
    assert_eq!(slow.recorder().payloads::<u32>(), expected);
}

// ============================================================================
// Unsubscribe and lifecycle
// ============================================================================

#[tokio::test]
async fn unsubscribing_unknown_subscription_is_a_noop() {
    let bus = InMemoryEventBus::new();
    let kept = bus.subscribe("t", "kept", handler_fn(|_| {})).await.unwrap();
    let stale = bus.subscribe("t", "stale", handler_fn(|_| {})).await.unwrap();
    bus.unsubscribe(&stale).await.unwrap();

    // A token for a type this bus never saw.
    let foreign = {
        let other = InMemoryEventBus::new();
        let token = other
            .subscribe("elsewhere", "ghost", handler_fn(|_| {}))
            .await
            .unwrap();
        other.shutdown().await.unwrap();
        token
    };

    assert!(bus.unsubscribe(&stale).await.is_ok());
    assert!(bus.unsubscribe(&foreign).await.is_ok());
    assert_eq!(bus.subscribed_types(), vec!["t".to_string()]);
    assert_eq!(bus.handler_count("t"), 1);
    assert_eq!(bus.consumer_state("t"), ConsumerState::Active);

    bus.unsubscribe(&kept).await.unwrap();
    assert!(bus.subscribed_types().is_empty());
}

#[tokio::test]
async fn unsubscribed_handler_stops_receiving() {
    let bus = InMemoryEventBus::new();
    let stays = RecordingHandler::new();
    let leaves = RecordingHandler::new();
    bus.subscribe("t", "stays", stays.clone()).await.unwrap();
    let leaving = bus.subscribe("t", "leaves", leaves.clone()).await.unwrap();

    bus.publish("t", &1).await.unwrap();
    assert!(leaves.wait_for_count(1, DELIVERY_TIMEOUT).await);

    bus.unsubscribe(&leaving).await.unwrap();
    bus.publish("t", &2).await.unwrap();

    assert!(stays.wait_for_count(2, DELIVERY_TIMEOUT).await);
    assert_eq!(leaves.payloads::<i32>(), vec![1]);
    assert_eq!(bus.handler_count("t"), 1);
}

#[tokio::test]
async fn last_unsubscribe_stops_and_removes_consumer() {
    let bus = InMemoryEventBus::new();
    let a = bus.subscribe("t", "a", handler_fn(|_| {})).await.unwrap();
    let b = bus.subscribe("t", "b", handler_fn(|_| {})).await.unwrap();
    let consumer = bus.consumer("t").unwrap();
    assert_eq!(consumer.state(), ConsumerState::Active);

    bus.unsubscribe(&a).await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Active);

    bus.unsubscribe(&b).await.unwrap();
    tokio::time::timeout(DELIVERY_TIMEOUT, consumer.wait_for(ConsumerState::Stopped))
        .await
        .expect("consumer did not stop");
    assert!(consumer.is_cancelled());
    assert_eq!(bus.consumer_state("t"), ConsumerState::Absent);
}

#[tokio::test]
async fn stopped_worker_drains_queued_events() {
    let bus = InMemoryEventBus::new();
    let slow = SlowHandler::new(Duration::from_millis(5));
    let sub = bus.subscribe("t", "slow", slow.clone()).await.unwrap();

    for n in 0..10 {
        bus.publish("t", &n).await.unwrap();
    }
    // Wait until the dispatcher has handed everything to the worker.
    assert!(slow.recorder().wait_for_count(1, DELIVERY_TIMEOUT).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.unsubscribe(&sub).await.unwrap();

    assert!(slow.recorder().wait_for_count(10, DELIVERY_TIMEOUT).await);
    assert_eq!(slow.recorder().payloads::<i32>(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn resubscribe_after_release_creates_fresh_consumer() {
    let bus = InMemoryEventBus::new();
    let first = bus.subscribe("t", "a", handler_fn(|_| {})).await.unwrap();
    let old = bus.consumer("t").unwrap();
    bus.unsubscribe(&first).await.unwrap();

    let recorder = RecordingHandler::new();
    bus.subscribe("t", "a", recorder.clone()).await.unwrap();
    let new = bus.consumer("t").unwrap();

    assert_ne!(old.id(), new.id());
    assert_eq!(old.state(), ConsumerState::Stopped);
    bus.publish("t", &1).await.unwrap();
    assert!(recorder.wait_for_count(1, DELIVERY_TIMEOUT).await);
}

#[tokio::test]
async fn shutdown_waits_for_workers_and_stops_consumers() {
    let bus = InMemoryEventBus::new();
    let slow = SlowHandler::new(Duration::from_millis(2));
    bus.subscribe("t", "slow", slow.clone()).await.unwrap();
    let consumer = bus.consumer("t").unwrap();

    for n in 0..5 {
        bus.publish("t", &n).await.unwrap();
    }
    assert!(slow.recorder().wait_for_count(5, DELIVERY_TIMEOUT).await);

    tokio::time::timeout(DELIVERY_TIMEOUT, bus.shutdown())
        .await
        .expect("shutdown hung")
        .unwrap();

    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert!(bus.subscribed_types().is_empty());
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn panicking_handler_keeps_receiving() {
    let reporter = CollectingFaultReporter::new();
    let bus = InMemoryEventBus::builder()
        .fault_reporter(reporter.clone())
        .build();
    let flaky = PanickingHandler::new(|e| e.payload_as::<i32>().ok() == Some(2));
    let healthy = RecordingHandler::new();
    bus.subscribe("t", "flaky", flaky.clone()).await.unwrap();
    bus.subscribe("t", "healthy", healthy.clone()).await.unwrap();

    for n in 1..=4 {
        bus.publish("t", &n).await.unwrap();
    }

    assert!(flaky.recorder().wait_for_count(3, DELIVERY_TIMEOUT).await);
    assert!(healthy.wait_for_count(4, DELIVERY_TIMEOUT).await);
    assert_eq!(flaky.recorder().payloads::<i32>(), vec![1, 3, 4]);

    let faults = reporter.faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].handler_name, "flaky");
    assert_eq!(faults[0].event_type, "t");
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_leaves_registry_consistent() {
    let bus = Arc::new(InMemoryEventBus::new());
    let mut tasks = Vec::new();

    for task in 0..16u32 {
        let bus = Arc::clone(&bus);
        tasks.push(tokio::spawn(async move {
            let mut kept: Vec<Subscription> = Vec::new();
            for round in 0..25u32 {
                let event_type = format!("type-{}", (task + round) % 8);
                let sub = bus
                    .subscribe(&event_type, &format!("h-{task}"), handler_fn(|_| {}))
                    .await
                    .unwrap();
                bus.publish(&event_type, &round).await.unwrap();
                if round % 3 == 0 {
                    kept.push(sub);
                } else {
                    bus.unsubscribe(&sub).await.unwrap();
                }
            }
            kept
        }));
    }

    let mut kept = Vec::new();
    for task in tasks {
        kept.extend(task.await.unwrap());
    }

    // Every type still in the registry has live handlers and matches what was kept.
    let mut expected: Vec<String> = kept.iter().map(|s| s.event_type().to_string()).collect();
    expected.sort();
    expected.dedup();
    assert_eq!(bus.subscribed_types(), expected);
    for event_type in bus.subscribed_types() {
        let count = kept.iter().filter(|s| s.event_type() == event_type).count();
        assert_eq!(bus.handler_count(&event_type), count);
        assert_eq!(bus.consumer_state(&event_type), ConsumerState::Active);
    }

    for sub in &kept {
        bus.unsubscribe(sub).await.unwrap();
    }
    assert!(wait_until(DELIVERY_TIMEOUT, || bus.subscribed_types().is_empty()).await);
}
