//! Per-type stream reader.
//!
//! One reader runs per subscribed event type. It owns a dedicated connection,
//! makes sure the consumer group exists, then loops on `XREADGROUP` with a
//! bounded `BLOCK` so cancellation is noticed within one block timeout (and
//! immediately while the read is pending, through `select!`).
//!
//! On every message: check that the consumer still has handlers, `XACK`,
//! decode, fan out. Transient failures reconnect after the configured backoff.
//! A `NOGROUP` reply (stream deleted, or Redis restarted without persistence)
//! makes the reader create the group again.

use crate::{BACKEND, ReaderConfig, stream_key};
use dddbus_core::consumer::ConsumerHandle;
use dddbus_core::event_bus::EventBusError;
use dddbus_core::registry::Registry;
use dddbus_core::wire::WireEvent;
use dddbus_core::worker::fan_out;
use dddbus_core::metrics;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why the read loop returned.
enum ReadExit {
    /// Cancelled, or no handlers left.
    Finished,
    /// Connection-level failure; reconnect after backoff.
    Failed(EventBusError),
    /// The stream or the group is gone; create the group again.
    GroupMissing(EventBusError),
}

pub(crate) struct StreamReader {
    client: redis::Client,
    registry: Arc<Registry>,
    handle: ConsumerHandle,
    config: Arc<ReaderConfig>,
    stream_key: String,
    consumer_name: String,
}

impl StreamReader {
    pub(crate) fn new(
        client: redis::Client,
        registry: Arc<Registry>,
        handle: ConsumerHandle,
        config: Arc<ReaderConfig>,
    ) -> Self {
        let stream_key = stream_key(handle.event_type());
        Self {
            client,
            registry,
            handle,
            config,
            stream_key,
            consumer_name: Uuid::new_v4().to_string(),
        }
    }

    pub(crate) async fn run(self) {
        let _guard = self.handle.enter_reader(BACKEND);
        let cancel = self.handle.cancellation_token().clone();
        let mut attempt = 0;
        let mut group_ready = false;

        tracing::debug!(
            stream = %self.stream_key,
            group = %self.config.group,
            consumer = %self.consumer_name,
            "Stream reader starting"
        );

        while !cancel.is_cancelled() {
            let Some(connected) = self.connect(&cancel).await else {
                break;
            };
            let mut conn = match connected {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(stream = %self.stream_key, error = %e, "Failed to connect stream reader");
                    if !self.config.backoff.sleep_or_cancel(attempt, &cancel).await {
                        break;
                    }
                    attempt += 1;
                    continue;
                },
            };

            if !group_ready {
                match self.ensure_group(&mut conn).await {
                    Ok(()) => group_ready = true,
                    Err(e) => {
                        tracing::warn!(
                            stream = %self.stream_key,
                            group = %self.config.group,
                            error = %e,
                            "Failed to create consumer group"
                        );
                        if !self.config.backoff.sleep_or_cancel(attempt, &cancel).await {
                            break;
                        }
                        attempt += 1;
                        continue;
                    },
                }
            }
            attempt = 0;

            match self.read_loop(&mut conn, &cancel).await {
                ReadExit::Finished => break,
                ReadExit::GroupMissing(e) => {
                    tracing::warn!(
                        stream = %self.stream_key,
                        group = %self.config.group,
                        error = %e,
                        "Consumer group disappeared, recreating it"
                    );
                    group_ready = false;
                },
                ReadExit::Failed(e) => {
                    tracing::warn!(stream = %self.stream_key, error = %e, "Failed to read events");
                    if !self.config.backoff.sleep_or_cancel(attempt, &cancel).await {
                        break;
                    }
                    attempt += 1;
                },
            }
        }

        tracing::debug!(stream = %self.stream_key, consumer = %self.consumer_name, "Stream reader exiting");
    }

    /// Open the reader's own connection. `None` if cancelled first.
    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Result<MultiplexedConnection, EventBusError>> {
        tokio::select! {
            () = cancel.cancelled() => None,
            conn = self.client.get_multiplexed_async_connection() => {
                Some(conn.map_err(|e| EventBusError::Connection(e.to_string())))
            },
        }
    }

    /// `XGROUP CREATE <key> <group> 0 MKSTREAM`; an existing group is fine.
    async fn ensure_group(&self, conn: &mut MultiplexedConnection) -> Result<(), EventBusError> {
        let created: RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream_key, &self.config.group, "0")
            .await;

        match created {
            Ok(()) => {
                tracing::debug!(stream = %self.stream_key, group = %self.config.group, "Consumer group created");
                Ok(())
            },
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(EventBusError::Provisioning {
                resource: format!("consumer group {} on {}", self.config.group, self.stream_key),
                reason: e.to_string(),
            }),
        }
    }

    async fn read_loop(&self, conn: &mut MultiplexedConnection, cancel: &CancellationToken) -> ReadExit {
        let block_ms = usize::try_from(self.config.block_timeout.as_millis()).unwrap_or(usize::MAX);
        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.consumer_name)
            .count(1)
            .block(block_ms);
        let keys = [self.stream_key.as_str()];

        loop {
            let read: RedisResult<Option<StreamReadReply>> = tokio::select! {
                () = cancel.cancelled() => return ReadExit::Finished,
                read = conn.xread_options(&keys, &[">"], &options) => read,
            };

            let reply = match read {
                Ok(Some(reply)) => reply,
                // Block timeout elapsed with nothing new.
                Ok(None) => continue,
                Err(e) if e.code() == Some("NOGROUP") => {
                    return ReadExit::GroupMissing(EventBusError::Connection(e.to_string()));
                },
                Err(e) => return ReadExit::Failed(EventBusError::Connection(e.to_string())),
            };

            for message in reply.keys.into_iter().flat_map(|stream| stream.ids) {
                let Some(senders) = self.registry.senders_for(&self.handle) else {
                    return ReadExit::Finished;
                };

                self.ack(conn, &message.id).await;

                let envelope = match decode(&message) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        metrics::record_malformed(BACKEND, self.handle.event_type());
                        tracing::warn!(
                            stream = %self.stream_key,
                            entry_id = %message.id,
                            error = %e,
                            "Skipping malformed event"
                        );
                        continue;
                    },
                };

                tracing::debug!(
                    stream = %self.stream_key,
                    entry_id = %message.id,
                    event_id = %envelope.id(),
                    handlers = senders.len(),
                    "Dispatching event to handlers"
                );
                fan_out(&senders, Arc::new(envelope)).await;
            }
        }
    }

    async fn ack(&self, conn: &mut MultiplexedConnection, entry_id: &str) {
        let acked: RedisResult<i64> = conn
            .xack(&self.stream_key, &self.config.group, &[entry_id])
            .await;
        if let Err(e) = acked {
            tracing::warn!(
                stream = %self.stream_key,
                entry_id = %entry_id,
                error = %e,
                "Failed to acknowledge event"
            );
        }
    }
}

fn decode(message: &StreamId) -> Result<dddbus_core::Envelope, EventBusError> {
    WireEvent::from_fields(|field| message.get::<String>(field))?.into_envelope()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use dddbus_core::Envelope;
    use redis::Value;
    use std::collections::HashMap;

    fn stream_entry(fields: &[(&str, &str)]) -> StreamId {
        let map: HashMap<String, Value> = fields
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::BulkString(v.as_bytes().to_vec())))
            .collect();
        StreamId {
            id: "1-0".to_string(),
            map,
        }
    }

    #[test]
    fn decodes_published_fields() {
        let envelope = Envelope::new("order.created", &serde_json::json!({ "id": 1 })).unwrap();
        let fields = WireEvent::from_envelope(&envelope).unwrap().to_fields();
        let borrowed: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (*k, v.as_str())).collect();

        let decoded = decode(&stream_entry(&borrowed)).unwrap();

        assert_eq!(decoded.id(), envelope.id());
        assert_eq!(decoded.timestamp_nanos(), envelope.timestamp_nanos());
        assert_eq!(decoded.payload(), envelope.payload());
    }

    #[test]
    fn missing_field_is_malformed() {
        let entry = stream_entry(&[("id", "not-checked"), ("type", "t"), ("time", "1")]);
        assert!(matches!(decode(&entry), Err(EventBusError::MalformedEvent(_))));
    }

    #[test]
    fn bad_id_is_malformed() {
        let entry = stream_entry(&[("id", "nope"), ("type", "t"), ("time", "1"), ("payload", "{}")]);
        assert!(matches!(decode(&entry), Err(EventBusError::MalformedEvent(_))));
    }
}
