//! Per-type topic reader.

use crate::{BACKEND, ReaderConfig, topic_name};
use dddbus_core::consumer::ConsumerHandle;
use dddbus_core::event_bus::EventBusError;
use dddbus_core::registry::Registry;
use dddbus_core::wire::WireEvent;
use dddbus_core::worker::fan_out;
use dddbus_core::{Envelope, metrics};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::types::RDKafkaErrorCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Reads one topic for one type consumer.
///
/// Lifecycle: create the topic (already existing is fine), join the consumer
/// group, then receive until cancelled or until the consumer has no handlers
/// left. Provisioning and consumer creation are retried after the backoff
/// until they succeed or the consumer is cancelled.
pub(crate) struct TopicReader {
    registry: Arc<Registry>,
    handle: ConsumerHandle,
    config: Arc<ReaderConfig>,
    topic: String,
}

impl TopicReader {
    pub(crate) fn new(
        registry: Arc<Registry>,
        handle: ConsumerHandle,
        config: Arc<ReaderConfig>,
    ) -> Self {
        let topic = topic_name(handle.event_type());
        Self {
            registry,
            handle,
            config,
            topic,
        }
    }

    pub(crate) async fn run(self) {
        let _guard = self.handle.enter_reader(BACKEND);
        let cancel = self.handle.cancellation_token().clone();

        let Some(consumer) = self.prepare(&cancel).await else {
            tracing::debug!(topic = %self.topic, "Topic reader cancelled before it was ready");
            return;
        };

        tracing::debug!(
            topic = %self.topic,
            consumer_group = %self.config.group,
            auto_offset_reset = %self.config.auto_offset_reset,
            "Topic reader starting"
        );

        let mut attempt = 0;
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = consumer.recv() => received,
            };

            let message = match received {
                Ok(message) => {
                    attempt = 0;
                    message
                },
                Err(e) => {
                    tracing::warn!(topic = %self.topic, error = %e, "Failed to receive message");
                    if !self.config.backoff.sleep_or_cancel(attempt, &cancel).await {
                        break;
                    }
                    attempt += 1;
                    continue;
                },
            };

            // Leave the record uncommitted if nobody is left to handle it.
            let Some(senders) = self.registry.senders_for(&self.handle) else {
                break;
            };

            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                tracing::warn!(
                    topic = %self.topic,
                    partition = message.partition(),
                    offset = message.offset(),
                    error = %e,
                    "Failed to commit offset"
                );
            }

            let partition = message.partition();
            let offset = message.offset();
            let decoded = decode(message.payload());
            drop(message);

            let envelope = match decoded {
                Ok(envelope) => envelope,
                Err(e) => {
                    metrics::record_malformed(BACKEND, self.handle.event_type());
                    tracing::warn!(
                        topic = %self.topic,
                        partition = partition,
                        offset = offset,
                        error = %e,
                        "Skipping malformed event"
                    );
                    continue;
                },
            };

            tracing::trace!(
                topic = %self.topic,
                partition = partition,
                offset = offset,
                event_id = %envelope.id(),
                handlers = senders.len(),
                "Dispatching event to handlers"
            );
            fan_out(&senders, Arc::new(envelope)).await;
        }

        tracing::debug!(topic = %self.topic, "Topic reader exiting");
    }

    /// Provision the topic and create the group consumer, retrying on failure.
    /// `None` once cancelled.
    async fn prepare(&self, cancel: &CancellationToken) -> Option<StreamConsumer> {
        let mut attempt = 0;
        loop {
            let prepared = tokio::select! {
                () = cancel.cancelled() => return None,
                provisioned = self.provision_topic() => {
                    provisioned.and_then(|()| self.create_consumer())
                },
            };

            match prepared {
                Ok(consumer) => return Some(consumer),
                Err(e) => {
                    tracing::warn!(
                        topic = %self.topic,
                        attempt,
                        error = %e,
                        "Failed to prepare topic reader, retrying"
                    );
                    if !self.config.backoff.sleep_or_cancel(attempt, cancel).await {
                        return None;
                    }
                    attempt += 1;
                },
            }
        }
    }

    async fn provision_topic(&self) -> Result<(), EventBusError> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .create()
            .map_err(|e| self.provisioning_error(e.to_string()))?;

        let topic = NewTopic::new(
            &self.topic,
            self.config.topic_partitions,
            TopicReplication::Fixed(self.config.topic_replication),
        );
        let options = AdminOptions::new()
            .operation_timeout(Some(self.config.provisioning_timeout))
            .request_timeout(Some(self.config.provisioning_timeout));

        let results = admin
            .create_topics(&[topic], &options)
            .await
            .map_err(|e| self.provisioning_error(e.to_string()))?;

        for result in results {
            match result {
                Ok(name) => tracing::debug!(topic = %name, "Topic created"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {},
                Err((_, code)) => return Err(self.provisioning_error(code.to_string())),
            }
        }
        Ok(())
    }

    fn create_consumer(&self) -> Result<StreamConsumer, EventBusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| EventBusError::Connection(format!("Failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| EventBusError::Connection(format!("Failed to subscribe to topic: {e}")))?;

        Ok(consumer)
    }

    fn provisioning_error(&self, reason: String) -> EventBusError {
        EventBusError::Provisioning {
            resource: self.topic.clone(),
            reason,
        }
    }
}

fn decode(payload: Option<&[u8]>) -> Result<Envelope, EventBusError> {
    let payload =
        payload.ok_or_else(|| EventBusError::MalformedEvent("Message has no payload".to_string()))?;
    WireEvent::from_json(payload)?.into_envelope()
}
