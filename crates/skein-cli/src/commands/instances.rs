//! `skein instance` subcommands

use std::sync::Arc;

use clap::Subcommand;
use tokio::sync::watch;
use tracing::info;

use skein_core::services::NoCaller;
use skein_core::{Message, WorkflowStatus};
use skein_runtime::broker::{in_memory_channel, MessageConsumer, MessageProducer};
use skein_runtime::config::MessagingKind;
use skein_runtime::{
    EngineConfig, EngineWorker, InProcessEventBus, OutboxProcessor, OutboxWorkerConfig,
};

use crate::backends;

#[derive(Subcommand)]
pub enum InstanceCommand {
    /// Start a workflow instance
    Start {
        name: String,

        /// Definition version; required when several are stored
        version: Option<String>,

        /// Initial input as JSON (defaults to null)
        #[arg(long)]
        input: Option<String>,

        /// Store this workflow document first (handy with the
        /// in-memory database, whose definitions live per-process)
        #[arg(long)]
        file: Option<String>,
    },
}

pub async fn run(command: InstanceCommand, config: &EngineConfig) -> anyhow::Result<()> {
    match command {
        InstanceCommand::Start {
            name,
            version,
            input,
            file,
        } => {
            start(
                config,
                &name,
                version.as_deref(),
                input.as_deref(),
                file.as_deref(),
            )
            .await
        }
    }
}

async fn start(
    config: &EngineConfig,
    name: &str,
    version: Option<&str>,
    input: Option<&str>,
    file: Option<&str>,
) -> anyhow::Result<()> {
    let input: serde_json::Value = match input {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("--input is not valid JSON: {e}"))?,
        None => serde_json::Value::Null,
    };

    let backends = backends::build(config).await?;
    if let Some(path) = file {
        let source = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {path}: {e}"))?;
        match backends.definitions.put(&source).await {
            Ok(_) | Err(skein_runtime::definitions::DefinitionError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    let version = match version {
        Some(v) => v.to_string(),
        None => {
            let mut versions: Vec<String> = backends
                .definitions
                .list()
                .await?
                .into_iter()
                .filter(|(n, _)| n == name)
                .map(|(_, v)| v)
                .collect();
            match versions.len() {
                0 => anyhow::bail!("no definition stored for {name}"),
                1 => versions.remove(0),
                n => anyhow::bail!("{n} versions stored for {name}; pass one explicitly"),
            }
        }
    };
    // fail fast before producing anything
    backends.definitions.get(name, &version).await?;

    let message = Message::start(name, &version, input);
    let workflow_id = message.workflow_id().unwrap_or_default();

    match config.messaging.kind {
        MessagingKind::InMemory => {
            info!(%workflow_id, "running instance inline");
            run_inline(config, backends, message).await
        }
        MessagingKind::Kafka => {
            publish_to_kafka(config, &message).await?;
            println!("started {name} {version} as {workflow_id}");
            Ok(())
        }
        MessagingKind::Rabbit => anyhow::bail!("rabbit messaging is not supported"),
    }
}

/// In-memory messaging: drive the instance to a terminal state in this
/// process and print the result
async fn run_inline(
    config: &EngineConfig,
    backends: backends::Backends,
    start: Message,
) -> anyhow::Result<()> {
    let (input_producer, input_consumer) = in_memory_channel(64);
    let (output_producer, mut output_consumer) = in_memory_channel(64);
    let input_producer = Arc::new(input_producer);
    let events = Arc::new(InProcessEventBus::new(
        input_producer.clone() as Arc<dyn MessageProducer>
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = EngineWorker::new(
        Box::new(input_consumer),
        Arc::new(output_producer),
        backends.outbox.clone(),
        backends.definitions.clone(),
        Arc::new(NoCaller),
        events,
        config.secrets.clone(),
        shutdown_rx.clone(),
    );
    let worker_handle = tokio::spawn(worker.run());

    let processor = OutboxProcessor::new(
        backends.outbox.clone(),
        input_producer.clone() as Arc<dyn MessageProducer>,
        OutboxWorkerConfig {
            batch_size: config.outbox.batch_size,
            poll_interval: std::time::Duration::from_millis(100),
            max_attempts: config.retry.max_attempts,
            ..Default::default()
        },
        shutdown_rx,
    );
    let processor_handle = tokio::spawn(processor.run());

    input_producer.publish(&start).await?;

    let terminal = loop {
        match output_consumer.next().await? {
            Some(delivery) => {
                if delivery.message.status.is_terminal() {
                    break delivery.message;
                }
            }
            None => anyhow::bail!("engine stopped before the instance finished"),
        }
    };
    let _ = shutdown_tx.send(true);
    worker_handle.abort();
    processor_handle.abort();

    match terminal.status {
        WorkflowStatus::Completed => {
            println!(
                "{}",
                serde_json::to_string_pretty(&terminal.output.unwrap_or_default())?
            );
        }
        WorkflowStatus::Faulted => {
            let error = terminal.error.map(|e| e.to_string()).unwrap_or_default();
            println!("faulted: {error}");
        }
        other => println!("finished with status {other}"),
    }
    Ok(())
}

#[cfg(feature = "kafka")]
async fn publish_to_kafka(config: &EngineConfig, message: &Message) -> anyhow::Result<()> {
    use skein_runtime::broker::{KafkaProducer, KafkaTransportConfig};

    let kafka = config
        .messaging
        .kafka
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("messaging.kafka settings are required"))?;
    let producer = KafkaProducer::connect(&KafkaTransportConfig {
        brokers: kafka.brokers.clone(),
        group_id: kafka.group_id.clone(),
        topic: kafka.input_topic.clone(),
    })?;
    producer.publish(message).await?;
    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn publish_to_kafka(_config: &EngineConfig, _message: &Message) -> anyhow::Result<()> {
    anyhow::bail!("this build lacks kafka support; rebuild with --features kafka")
}
