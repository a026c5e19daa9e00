//! In-memory transport over a bounded tokio channel
//!
//! The default for tests and the `in-memory` messaging configuration.
//! The bounded channel provides natural backpressure: `publish` waits
//! for capacity.

use async_trait::async_trait;
use tokio::sync::mpsc;

use skein_core::Message;

use super::{Delivery, MessageConsumer, MessageProducer, TransportError};

/// Create a connected (producer, consumer) pair with the given capacity
pub fn in_memory_channel(capacity: usize) -> (InMemoryProducer, InMemoryConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (InMemoryProducer { tx }, InMemoryConsumer { rx })
}

/// Producer half of the in-memory transport
#[derive(Clone)]
pub struct InMemoryProducer {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl MessageProducer for InMemoryProducer {
    async fn publish(&self, message: &Message) -> Result<(), TransportError> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))
    }
}

/// Consumer half of the in-memory transport
pub struct InMemoryConsumer {
    rx: mpsc::Receiver<Message>,
}

#[async_trait]
impl MessageConsumer for InMemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        Ok(self.rx.recv().await.map(Delivery::pre_acked))
    }
}
