//! `skein listen`: run the engine until interrupted
//!
//! Wires the configured transport to the engine worker and the outbox
//! workers. `messaging.consumer.enabled` gates the advancement loop;
//! `messaging.producer.enabled` gates outbox re-emission.

use tracing::info;

use skein_runtime::config::MessagingKind;
use skein_runtime::EngineConfig;

pub async fn run(config: &EngineConfig) -> anyhow::Result<()> {
    match config.messaging.kind {
        MessagingKind::Kafka => listen_kafka(config).await,
        MessagingKind::InMemory => {
            anyhow::bail!("listen requires a cross-process broker; configure messaging.type=kafka")
        }
        MessagingKind::Rabbit => anyhow::bail!("rabbit messaging is not supported"),
    }
}

#[cfg(feature = "kafka")]
async fn listen_kafka(config: &EngineConfig) -> anyhow::Result<()> {
    use std::sync::Arc;
    use tokio::sync::watch;

    use skein_runtime::broker::{
        KafkaConsumer, KafkaProducer, KafkaTransportConfig, MessageProducer,
    };
    use skein_runtime::{
        EngineWorker, HttpCaller, InProcessEventBus, OutboxJanitor, OutboxProcessor,
        OutboxWorkerConfig,
    };

    let backends = crate::backends::build(config).await?;
    let kafka = config
        .messaging
        .kafka
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("messaging.kafka settings are required"))?;
    let input = KafkaTransportConfig {
        brokers: kafka.brokers.clone(),
        group_id: kafka.group_id.clone(),
        topic: kafka.input_topic.clone(),
    };
    let output = KafkaTransportConfig {
        brokers: kafka.brokers.clone(),
        group_id: kafka.group_id.clone(),
        topic: kafka.output_topic.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    let loopback: Arc<dyn MessageProducer> = Arc::new(KafkaProducer::connect(&input)?);

    if config.messaging.consumer.enabled {
        let consumer = KafkaConsumer::connect(&input)?;
        let events = Arc::new(InProcessEventBus::new(loopback.clone()));
        let worker = EngineWorker::new(
            Box::new(consumer),
            Arc::new(KafkaProducer::connect(&output)?),
            backends.outbox.clone(),
            backends.definitions.clone(),
            Arc::new(HttpCaller::new()),
            events,
            config.secrets.clone(),
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(worker.run()));
    }

    if config.messaging.producer.enabled {
        let worker_config = OutboxWorkerConfig {
            batch_size: config.outbox.batch_size,
            max_attempts: config.retry.max_attempts,
            retention: config
                .outbox
                .retention
                .to_chrono()
                .map_err(|e| anyhow::anyhow!("outbox.retention: {e}"))?,
            poll_interval: std::time::Duration::from_millis(
                config
                    .outbox
                    .poll_interval
                    .to_millis()
                    .map_err(|e| anyhow::anyhow!("outbox.poll-interval: {e}"))?,
            ),
            ..Default::default()
        };
        let processor = OutboxProcessor::new(
            backends.outbox.clone(),
            loopback,
            worker_config.clone(),
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(processor.run()));

        let janitor = OutboxJanitor::new(backends.outbox.clone(), worker_config, shutdown_rx);
        handles.push(tokio::spawn(janitor.run()));
    }

    info!("engine running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn listen_kafka(_config: &EngineConfig) -> anyhow::Result<()> {
    anyhow::bail!("this build lacks kafka support; rebuild with --features kafka")
}
