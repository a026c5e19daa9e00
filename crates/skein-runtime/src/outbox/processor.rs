//! Outbox worker loops
//!
//! The processor periodically claims due rows and re-emits their
//! payloads to the broker; the janitor deletes old sent rows. Both run
//! until their shutdown channel flips.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::broker::MessageProducer;

use super::store::{OutboxBatch, OutboxEntry, OutboxError, OutboxStore};

/// Tuning for the processor and janitor loops
#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    /// Rows claimed per processing pass
    pub batch_size: u32,

    /// Pause between processing passes
    pub poll_interval: Duration,

    /// Re-emit attempts before a row is quarantined
    pub max_attempts: u32,

    /// How long sent rows are kept before the janitor removes them
    pub retention: chrono::Duration,

    /// Pause between janitor sweeps
    pub sweep_interval: Duration,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
            retention: chrono::Duration::hours(24),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Claims due rows and re-emits them to the broker
pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    producer: Arc<dyn MessageProducer>,
    config: OutboxWorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        producer: Arc<dyn MessageProducer>,
        config: OutboxWorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            producer,
            config,
            shutdown,
        }
    }

    /// Run until shutdown
    pub async fn run(mut self) {
        info!(
            batch_size = self.config.batch_size,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "outbox processor started"
        );
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.process_once().await {
                Ok(batch) if batch.claimed > 0 => {
                    debug!(sent = batch.sent, failed = batch.failed, "outbox pass complete");
                    // drain eagerly while rows are due
                    continue;
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "outbox pass failed"),
            }
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("outbox processor stopped");
    }

    /// One claim-and-dispatch pass
    #[instrument(skip(self))]
    pub async fn process_once(&self) -> Result<OutboxBatch, OutboxError> {
        let producer = self.producer.clone();
        self.store
            .process_due(
                self.config.max_attempts,
                self.config.batch_size,
                &move |entry: OutboxEntry| {
                    let producer = producer.clone();
                    Box::pin(async move {
                        let message = entry.message().map_err(|e| e.to_string())?;
                        producer.publish(&message).await.map_err(|e| e.to_string())
                    })
                },
            )
            .await
    }
}

/// Deletes sent rows past the retention window
pub struct OutboxJanitor {
    store: Arc<dyn OutboxStore>,
    config: OutboxWorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl OutboxJanitor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        config: OutboxWorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            config,
            shutdown,
        }
    }

    /// Run until shutdown
    pub async fn run(mut self) {
        info!(
            retention_hours = self.config.retention.num_hours(),
            "outbox janitor started"
        );
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "swept sent outbox rows"),
                Err(e) => error!(error = %e, "outbox sweep failed"),
            }
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("outbox janitor stopped");
    }

    /// One retention sweep
    pub async fn sweep_once(&self) -> Result<u64, OutboxError> {
        let cutoff = chrono::Utc::now() - self.config.retention;
        self.store
            .sweep_sent(cutoff, self.config.batch_size)
            .await
    }
}
