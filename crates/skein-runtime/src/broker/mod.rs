//! Broker transports
//!
//! One logical input channel (the engine consumes) and one logical
//! output channel (the engine produces). Transports are pluggable;
//! deliveries carry a manual acknowledgement so a crash before ack
//! redelivers the message instead of losing it.

mod memory;

#[cfg(feature = "kafka")]
mod kafka;

pub use memory::{in_memory_channel, InMemoryConsumer, InMemoryProducer};

#[cfg(feature = "kafka")]
pub use kafka::{KafkaConsumer, KafkaProducer, KafkaTransportConfig};

use async_trait::async_trait;

use skein_core::Message;

/// Transport failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Channel or connection is gone
    #[error("transport closed: {0}")]
    Closed(String),

    /// Publish or receive failed
    #[error("transport error: {0}")]
    Io(String),

    /// Payload did not decode as a message
    #[error("malformed payload: {0}")]
    Codec(String),
}

/// A consumed message plus its acknowledgement handle
pub struct Delivery {
    pub message: Message,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    /// Wrap a message with an acknowledgement handle
    pub fn new(message: Message, acker: Box<dyn Acker>) -> Self {
        Self {
            message,
            acker: Some(acker),
        }
    }

    /// A delivery that needs no acknowledgement (in-memory transport)
    pub fn pre_acked(message: Message) -> Self {
        Self {
            message,
            acker: None,
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(mut self) -> Result<(), TransportError> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

/// Transport-specific acknowledgement
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;
}

/// Produces messages onto the output channel
#[async_trait]
pub trait MessageProducer: Send + Sync + 'static {
    async fn publish(&self, message: &Message) -> Result<(), TransportError>;
}

/// Consumes messages from the input channel
///
/// `next` resolves with `None` once the transport is closed; consumers
/// poll one delivery at a time, which is the backpressure boundary.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError>;
}
