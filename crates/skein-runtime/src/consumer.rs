//! Engine consumer loop
//!
//! Consumes one continuation at a time from the input channel, runs one
//! advancement, and routes the result: immediate continuations and
//! terminal messages to the output producer, scheduled resumptions into
//! the outbox, listening continuations into the event bus. The delivery
//! is acked only after routing, so a crash mid-advancement redelivers.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use skein_core::services::{Caller, EventSink};
use skein_core::tree::TreeCache;
use skein_core::{
    AdvanceOutcome, ExecutorError, Message, Position, WorkflowError, WorkflowExecutor,
    WorkflowStatus,
};

use crate::broker::{MessageConsumer, MessageProducer, TransportError};
use crate::definitions::{DefinitionError, DefinitionStore};
use crate::events::InProcessEventBus;
use crate::outbox::{OutboxEntry, OutboxError, OutboxStore};

/// Error type for the consumer loop
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// The engine worker: one advancement per consumed message
pub struct EngineWorker {
    consumer: Box<dyn MessageConsumer>,
    output: Arc<dyn MessageProducer>,
    outbox: Arc<dyn OutboxStore>,
    definitions: Arc<dyn DefinitionStore>,
    trees: Arc<TreeCache>,
    caller: Arc<dyn Caller>,
    events: Arc<InProcessEventBus>,
    secrets: Map<String, Value>,
    shutdown: watch::Receiver<bool>,
}

impl EngineWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: Box<dyn MessageConsumer>,
        output: Arc<dyn MessageProducer>,
        outbox: Arc<dyn OutboxStore>,
        definitions: Arc<dyn DefinitionStore>,
        caller: Arc<dyn Caller>,
        events: Arc<InProcessEventBus>,
        secrets: Map<String, Value>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            consumer,
            output,
            outbox,
            definitions,
            trees: Arc::new(TreeCache::new()),
            caller,
            events,
            secrets,
            shutdown,
        }
    }

    /// Consume until the input channel closes or shutdown flips
    pub async fn run(mut self) {
        info!("engine worker started");
        loop {
            let mut shutdown = self.shutdown.clone();
            let delivery = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.consumer.next() => next,
            };
            let delivery = match delivery {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    debug!("input channel closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "consume failed, retrying");
                    continue;
                }
            };
            if *self.shutdown.borrow() {
                break;
            }

            let message = delivery.message.clone();
            match self.handle(message).await {
                Ok(()) => {
                    if let Err(e) = delivery.ack().await {
                        warn!(error = %e, "ack failed");
                    }
                }
                // no ack: the transport redelivers and the advancement
                // reruns from the same checkpoint
                Err(e) => error!(error = %e, "advancement failed, leaving message unacked"),
            }
        }
        info!("engine worker stopped");
    }

    /// Advance one message and route the outcome
    #[instrument(skip(self, message), fields(workflow = %message.name, position = %message.position))]
    pub async fn handle(&self, message: Message) -> Result<(), WorkerError> {
        if message.status.is_terminal() {
            debug!(status = %message.status, "dropping terminal message");
            return Ok(());
        }

        let definition = match self.definitions.get(&message.name, &message.version).await {
            Ok(found) => found,
            Err(DefinitionError::NotFound { .. }) => {
                let error = WorkflowError::configuration(
                    &Position::root(),
                    format!(
                        "no definition for workflow {} {}",
                        message.name, message.version
                    ),
                );
                return self.publish_fault(message, error).await;
            }
            Err(e) => return Err(e.into()),
        };
        let tree = match self.trees.get_or_build(definition.document.clone()) {
            Ok(tree) => tree,
            Err(e) => {
                let error = WorkflowError::configuration(&Position::root(), e.to_string());
                return self.publish_fault(message, error).await;
            }
        };

        let executor = WorkflowExecutor::new(tree)
            .with_caller(self.caller.clone())
            .with_event_sink(self.events.clone() as Arc<dyn EventSink>)
            .with_secrets(self.secrets.clone());

        let outcome = match executor.advance(message).await {
            Ok(outcome) => outcome,
            Err(ExecutorError::AlreadyTerminal(status)) => {
                debug!(%status, "message raced to terminal, dropping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match outcome {
            AdvanceOutcome::Completed { message, .. } => {
                debug!("workflow completed, publishing terminal message");
                self.output.publish(&message).await?;
            }
            AdvanceOutcome::Faulted { message, error } => {
                warn!(error = %error, "workflow faulted");
                self.output.publish(&message).await?;
            }
            AdvanceOutcome::Scheduled { message, delay } => {
                let entry = OutboxEntry::schedule(&message, delay, Utc::now())?;
                debug!(delay_ms = delay.num_milliseconds(), entry = %entry.id, "parking continuation in outbox");
                self.outbox.insert(&[entry]).await?;
            }
            AdvanceOutcome::Listening { message, filters } => {
                self.events.register(message, filters);
            }
        }
        Ok(())
    }

    async fn publish_fault(
        &self,
        mut message: Message,
        error: WorkflowError,
    ) -> Result<(), WorkerError> {
        warn!(error = %error, "faulting workflow before advancement");
        message.status = WorkflowStatus::Faulted;
        message.error = Some(error);
        self.output.publish(&message).await?;
        Ok(())
    }
}
