//! Metric names and recording helpers.
//!
//! Metrics go through the `metrics` facade. The library never installs a
//! recorder; applications choose an exporter.
//!
//! Publish, malformed and consumer metrics carry a `backend` label (`memory`,
//! `redis`, `kafka`); per-event metrics carry an `event_type` label.

use metrics::{counter, gauge};

/// Events accepted by the backend on publish.
pub const EVENTS_PUBLISHED: &str = "dddbus_events_published_total";
/// Events pushed onto handler queues.
pub const EVENTS_DELIVERED: &str = "dddbus_events_delivered_total";
/// Handler panics caught by workers.
pub const HANDLER_FAULTS: &str = "dddbus_handler_faults_total";
/// Messages skipped because they could not be decoded.
pub const MALFORMED_EVENTS: &str = "dddbus_malformed_events_total";
/// Type consumers currently running.
pub const ACTIVE_CONSUMERS: &str = "dddbus_active_consumers";

/// Record a successful publish.
pub fn record_published(backend: &'static str, event_type: &str) {
    counter!(EVENTS_PUBLISHED, "backend" => backend, "event_type" => event_type.to_string())
        .increment(1);
}

/// Record `handlers` queue pushes for one event.
pub fn record_delivered(event_type: &str, handlers: usize) {
    counter!(EVENTS_DELIVERED, "event_type" => event_type.to_string()).increment(handlers as u64);
}

/// Record a caught handler panic.
pub fn record_handler_fault(event_type: &str) {
    counter!(HANDLER_FAULTS, "event_type" => event_type.to_string()).increment(1);
}

/// Record a skipped, undecodable message.
pub fn record_malformed(backend: &'static str, event_type: &str) {
    counter!(MALFORMED_EVENTS, "backend" => backend, "event_type" => event_type.to_string())
        .increment(1);
}

/// Record a consumer starting (`+1.0`) or stopping (`-1.0`).
pub fn record_consumer_delta(backend: &'static str, delta: f64) {
    gauge!(ACTIVE_CONSUMERS, "backend" => backend).increment(delta);
}
