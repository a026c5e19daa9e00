//! Kafka transport over rdkafka
//!
//! One topic per logical channel. Offsets are committed only after the
//! engine acks a delivery, so a crash mid-advancement redelivers the
//! message (at-least-once, matching the outbox guarantee).

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message as _};
use std::sync::Arc;
use std::time::Duration;

use skein_core::Message;

use super::{Acker, Delivery, MessageConsumer, MessageProducer, TransportError};

/// Connection settings for the Kafka transport
#[derive(Debug, Clone)]
pub struct KafkaTransportConfig {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
}

/// Kafka producer for the output channel
pub struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaProducer {
    pub fn connect(config: &KafkaTransportConfig) -> Result<Self, TransportError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self {
            producer,
            topic: config.topic.clone(),
        })
    }
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    async fn publish(&self, message: &Message) -> Result<(), TransportError> {
        let payload = message
            .encode()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        // key by workflow id so one instance stays on one partition,
        // preserving causal order
        let key = message
            .workflow_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        self.producer
            .send(
                FutureRecord::to(&self.topic).payload(&payload).key(&key),
                Duration::from_secs(30),
            )
            .await
            .map_err(|(e, _)| TransportError::Io(e.to_string()))?;
        Ok(())
    }
}

/// Kafka consumer for the input channel
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
}

impl KafkaConsumer {
    pub fn connect(config: &KafkaTransportConfig) -> Result<Self, TransportError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }
}

struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl Acker for KafkaAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        let mut list = rdkafka::TopicPartitionList::new();
        list.add_partition_offset(
            &self.topic,
            self.partition,
            rdkafka::Offset::Offset(self.offset + 1),
        )
        .map_err(|e| TransportError::Io(e.to_string()))?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        let borrowed = self
            .consumer
            .recv()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let payload = borrowed
            .payload()
            .ok_or_else(|| TransportError::Codec("empty payload".to_string()))?;
        let message =
            Message::decode(payload).map_err(|e| TransportError::Codec(e.to_string()))?;
        let acker = KafkaAcker {
            consumer: self.consumer.clone(),
            topic: borrowed.topic().to_string(),
            partition: borrowed.partition(),
            offset: borrowed.offset(),
        };
        Ok(Some(Delivery::new(message, Box::new(acker))))
    }
}
