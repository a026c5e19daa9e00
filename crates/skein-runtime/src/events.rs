//! In-process event bus
//!
//! Routes Emit events to workflows parked on Listen. A parked listen is
//! registered with its continuation message; when a matching event
//! arrives, the event envelope is appended to the listen node's durable
//! state and the continuation is re-enqueued on the input channel. The
//! kernel re-evaluates the consumption strategy when it consumes the
//! message, so partial `all` fan-ins simply park again.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use skein_core::dsl::EventFilter;
use skein_core::services::{CloudEvent, EventSink};
use skein_core::{event, Message, Position, WorkflowError};

use crate::broker::MessageProducer;

struct PendingListen {
    message: Message,
    filters: Vec<EventFilter>,
}

/// Event bus connecting Emit to Listen inside one runtime
pub struct InProcessEventBus {
    producer: Arc<dyn MessageProducer>,
    pending: Mutex<Vec<PendingListen>>,
}

impl InProcessEventBus {
    /// `producer` must publish onto the engine's input channel
    pub fn new(producer: Arc<dyn MessageProducer>) -> Self {
        Self {
            producer,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Park a listening continuation until a matching event arrives
    pub fn register(&self, message: Message, filters: Vec<EventFilter>) {
        debug!(position = %message.position, filters = filters.len(), "listen registered");
        self.pending.lock().push(PendingListen { message, filters });
    }

    /// Number of parked listens
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Deliver an event envelope to every matching parked listen
    ///
    /// Returns how many continuations were woken.
    pub async fn notify(&self, event: &CloudEvent) -> usize {
        let envelope = event.to_value();
        let woken: Vec<PendingListen> = {
            let mut pending = self.pending.lock();
            let mut woken = Vec::new();
            let mut index = 0;
            while index < pending.len() {
                if listen_matches(&pending[index], &envelope) {
                    woken.push(pending.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            woken
        };

        let mut count = 0;
        for mut parked in woken {
            let position = parked.message.position.clone();
            if let Some(state) = parked.message.states.get_mut(&position) {
                state.events.get_or_insert_with(Vec::new).push(envelope.clone());
            }
            match self.producer.publish(&parked.message).await {
                Ok(()) => count += 1,
                Err(e) => {
                    warn!(error = %e, "failed to re-enqueue listening continuation");
                    self.pending.lock().push(parked);
                }
            }
        }
        count
    }
}

fn listen_matches(parked: &PendingListen, envelope: &Value) -> bool {
    let at = Position::parse(&parked.message.position).unwrap_or_else(|_| Position::root());
    parked.filters.iter().any(|filter| {
        event::matches(filter, envelope, &at).unwrap_or_else(|e: WorkflowError| {
            warn!(error = %e, "event filter evaluation failed, treating as no match");
            false
        })
    })
}

#[async_trait]
impl EventSink for InProcessEventBus {
    async fn emit(&self, event: &CloudEvent, _at: &Position) -> Result<(), WorkflowError> {
        let woken = self.notify(event).await;
        debug!(event_id = %event.id, event_type = %event.event_type, woken, "event emitted");
        Ok(())
    }
}
