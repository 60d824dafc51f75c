//! Broker producer bridge
//!
//! Owns the Kafka producer and the delivery-notification plumbing. The
//! producer client services network I/O on its own threads, but it never
//! touches pipeline state: delivery notifications are captured into a queue
//! by the producer context and observed only when the supervisor explicitly
//! polls, so all pipeline mutation stays on the one supervisor thread.

use crate::config::BridgeConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::types::{Delivery, MessageEnvelope};
use rdkafka::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Result of one enqueue attempt. The envelope travels back out of the
/// rejecting variants so the caller can retry (queue-full) or account for
/// the failure without it ever reaching a transaction counter.
pub enum EnqueueOutcome {
    /// The broker client accepted the message; it now owns the buffers.
    Enqueued,
    /// The outbound queue is saturated; drive backpressure and retry.
    QueueFull(MessageEnvelope),
    /// Any other producer error.
    Rejected(MessageEnvelope, String),
}

/// The producer operations the pipeline depends on.
pub trait MessageBroker {
    /// Enqueues a message with an unspecified partition, leaving partition
    /// selection to the topic's partitioner.
    fn enqueue(
        &mut self,
        topic: &str,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        envelope: MessageEnvelope,
    ) -> EnqueueOutcome;

    /// Services producer I/O for up to `timeout` and drains any delivery
    /// notifications that arrived.
    fn poll(&mut self, timeout: Duration, out: &mut Vec<Delivery>);

    /// Messages enqueued but not yet delivered.
    fn in_flight(&self) -> usize;

    /// Blocks until in-flight messages are delivered or the grace period
    /// elapses.
    fn flush(&mut self, grace: Duration) -> BridgeResult<()>;
}

/// Producer context that captures delivery reports. librdkafka invokes it
/// from within `poll`, on the polling thread.
struct DeliveryCollector {
    acks: Arc<Mutex<VecDeque<Delivery>>>,
}

impl ClientContext for DeliveryCollector {}

impl ProducerContext for DeliveryCollector {
    type DeliveryOpaque = Box<MessageEnvelope>;

    fn delivery(&self, result: &DeliveryResult<'_>, envelope: Self::DeliveryOpaque) {
        let error = match result {
            Ok(_) => None,
            Err((err, message)) => Some(format!(
                "message delivery to topic {} failed: {}",
                message.topic(),
                err
            )),
        };
        let mut queue = self.acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.push_back(Delivery {
            envelope: *envelope,
            error,
        });
    }
}

/// rdkafka-backed implementation of [`MessageBroker`].
pub struct KafkaBroker {
    producer: BaseProducer<DeliveryCollector>,
    acks: Arc<Mutex<VecDeque<Delivery>>>,
}

impl KafkaBroker {
    /// Creates the producer from the configured broker list and pass-through
    /// properties.
    pub fn connect(config: &BridgeConfig) -> BridgeResult<Self> {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &config.brokers);
        // Identical keys must map to identical partitions so per-key ordering
        // and log compaction work downstream; unkeyed messages are spread
        // uniformly instead of hammering one partition.
        client_config.set("partitioner", "consistent_random");

        for (property, value) in &config.kafka_config {
            client_config.set(property, value);
        }
        // Topic-level properties set on the client config become the default
        // topic configuration in librdkafka.
        for (property, value) in &config.topic_config {
            client_config.set(property, value);
        }

        let acks: Arc<Mutex<VecDeque<Delivery>>> = Arc::new(Mutex::new(VecDeque::new()));
        let producer: BaseProducer<DeliveryCollector> = client_config
            .create_with_context(DeliveryCollector {
                acks: Arc::clone(&acks),
            })
            .map_err(|e| BridgeError::broker(format!("could not create Kafka producer: {e}")))?;

        info!("connected Kafka producer to {}", config.brokers);
        Ok(Self { producer, acks })
    }
}

impl MessageBroker for KafkaBroker {
    fn enqueue(
        &mut self,
        topic: &str,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        envelope: MessageEnvelope,
    ) -> EnqueueOutcome {
        let mut record: BaseRecord<'_, [u8], [u8], Box<MessageEnvelope>> =
            BaseRecord::with_opaque_to(topic, Box::new(envelope));
        record.key = key;
        record.payload = value;

        match self.producer.send(record) {
            Ok(()) => EnqueueOutcome::Enqueued,
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), record)) => {
                EnqueueOutcome::QueueFull(*record.delivery_opaque)
            }
            Err((err, record)) => EnqueueOutcome::Rejected(*record.delivery_opaque, err.to_string()),
        }
    }

    fn poll(&mut self, timeout: Duration, out: &mut Vec<Delivery>) {
        self.producer.poll(timeout);
        let mut queue = self.acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        out.extend(queue.drain(..));
    }

    fn in_flight(&self) -> usize {
        self.producer.in_flight_count().max(0) as usize
    }

    fn flush(&mut self, grace: Duration) -> BridgeResult<()> {
        self.producer
            .flush(grace)
            .map_err(|e| BridgeError::broker(format!("failed to flush producer: {e}")))
    }
}
