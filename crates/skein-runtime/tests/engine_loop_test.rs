//! End-to-end runtime tests over the in-memory backends
//!
//! The worker's `handle` is driven directly so each advancement is a
//! deterministic step; the outbox processor stands in for elapsed time
//! by re-emitting entries whose due instant has been rewound.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map};
use tokio::sync::watch;

use skein_core::services::NoCaller;
use skein_core::{Message, Position, WorkflowStatus};
use skein_runtime::prelude::*;

const WAIT_SOURCE: &str = r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: wait-flow
  version: "1.0.0"
do:
  - w:
      wait: PT30S
  - s:
      set:
        done: true
"#;

const RETRY_SOURCE: &str = r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: retry-flow
  version: "1.0.0"
do:
  - guarded:
      try:
        - boom:
            raise:
              error:
                type: https://serverlessworkflow.io/spec/1.0.0/errors/not-implemented
                status: 500
      catch:
        errors:
          with:
            status: 500
        retry:
          delay: PT1S
          backoff:
            constant: {}
          limit:
            attempt:
              count: 2
"#;

const LISTEN_SOURCE: &str = r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: listen-flow
  version: "1.0.0"
do:
  - waitForOrder:
      listen:
        to:
          one:
            with:
              type: order.placed
  - confirm:
      set:
        confirmed: "${ .id }"
"#;

struct Rig {
    worker: EngineWorker,
    input_consumer: skein_runtime::broker::InMemoryConsumer,
    input_producer: Arc<skein_runtime::broker::InMemoryProducer>,
    output_consumer: skein_runtime::broker::InMemoryConsumer,
    outbox: Arc<InMemoryOutboxStore>,
    events: Arc<InProcessEventBus>,
    _shutdown: watch::Sender<bool>,
}

async fn rig(sources: &[&str]) -> Rig {
    let (input_producer, input_consumer) = in_memory_channel(32);
    let (output_producer, output_consumer) = in_memory_channel(32);
    let input_producer = Arc::new(input_producer);

    let outbox = Arc::new(InMemoryOutboxStore::new());
    let definitions = Arc::new(InMemoryDefinitionStore::new());
    for source in sources {
        definitions.put(source).await.unwrap();
    }
    let events = Arc::new(InProcessEventBus::new(
        input_producer.clone() as Arc<dyn MessageProducer>
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // the worker's own consumer half is unused: tests call handle()
    // directly for deterministic stepping
    let (_idle_producer, idle_consumer) = in_memory_channel(1);
    let worker = EngineWorker::new(
        Box::new(idle_consumer),
        Arc::new(output_producer),
        outbox.clone() as Arc<dyn OutboxStore>,
        definitions,
        Arc::new(NoCaller),
        events.clone(),
        Map::new(),
        shutdown_rx,
    );

    Rig {
        worker,
        input_consumer,
        input_producer,
        output_consumer,
        outbox,
        events,
        _shutdown: shutdown_tx,
    }
}

/// Rewind every pending entry so the processor sees it as due
async fn rewind_outbox(outbox: &InMemoryOutboxStore) {
    let rewound: Vec<OutboxEntry> = outbox
        .snapshot()
        .into_iter()
        .filter(|e| e.status == OutboxStatus::Pending)
        .map(|mut e| {
            e.delayed_until = chrono::Utc::now() - chrono::Duration::milliseconds(1);
            e
        })
        .collect();
    outbox.update(&rewound).await.unwrap();
}

#[tokio::test]
async fn test_wait_parks_in_outbox_and_resumes() {
    let mut rig = rig(&[WAIT_SOURCE]).await;

    let before = chrono::Utc::now();
    let start = Message::start("wait-flow", "1.0.0", json!({}));
    rig.worker.handle(start).await.unwrap();

    // the continuation is parked with delayedUntil ~ now + 30s
    let entries = rig.outbox.snapshot();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.status, OutboxStatus::Pending);
    let delay = entry.delayed_until - before;
    assert!(delay >= chrono::Duration::seconds(29));
    assert!(delay <= chrono::Duration::seconds(31));
    let parked = entry.message().unwrap();
    assert_eq!(parked.position, "/do/0/w");
    assert_eq!(parked.status, WorkflowStatus::Waiting);

    // once due, the processor re-emits the payload onto the input
    // channel
    rewind_outbox(&rig.outbox).await;
    let (_tx, shutdown_rx) = watch::channel(false);
    let processor = OutboxProcessor::new(
        rig.outbox.clone() as Arc<dyn OutboxStore>,
        rig.input_producer.clone() as Arc<dyn MessageProducer>,
        OutboxWorkerConfig::default(),
        shutdown_rx,
    );
    let batch = processor.process_once().await.unwrap();
    assert_eq!(batch.sent, 1);

    // consuming the resumption finishes the workflow
    let delivery = rig.input_consumer.next().await.unwrap().unwrap();
    rig.worker.handle(delivery.message).await.unwrap();

    let terminal = rig.output_consumer.next().await.unwrap().unwrap().message;
    assert_eq!(terminal.status, WorkflowStatus::Completed);
    assert_eq!(terminal.output, Some(json!({"done": true})));
}

#[tokio::test]
async fn test_retry_cycles_through_outbox_then_faults() {
    let mut rig = rig(&[RETRY_SOURCE]).await;

    let start = Message::start("retry-flow", "1.0.0", json!({}));
    rig.worker.handle(start).await.unwrap();

    let mut due_instants = Vec::new();
    for _cycle in 0..2 {
        let entries: Vec<OutboxEntry> = rig
            .outbox
            .snapshot()
            .into_iter()
            .filter(|e| e.status == OutboxStatus::Pending)
            .collect();
        assert_eq!(entries.len(), 1);
        due_instants.push(entries[0].delayed_until);

        rewind_outbox(&rig.outbox).await;
        let (_tx, shutdown_rx) = watch::channel(false);
        let processor = OutboxProcessor::new(
            rig.outbox.clone() as Arc<dyn OutboxStore>,
            rig.input_producer.clone() as Arc<dyn MessageProducer>,
            OutboxWorkerConfig::default(),
            shutdown_rx,
        );
        processor.process_once().await.unwrap();
        let delivery = rig.input_consumer.next().await.unwrap().unwrap();
        rig.worker.handle(delivery.message).await.unwrap();
    }

    // retries of the same try are never scheduled out of order
    assert!(due_instants[0] <= due_instants[1]);

    // after two retry cycles the workflow faults with the original
    // error preserved
    let terminal = rig.output_consumer.next().await.unwrap().unwrap().message;
    assert_eq!(terminal.status, WorkflowStatus::Faulted);
    let error = terminal.error.unwrap();
    assert_eq!(error.status, 500);
    assert_eq!(
        error.error_type,
        "https://serverlessworkflow.io/spec/1.0.0/errors/not-implemented"
    );
}

#[tokio::test]
async fn test_listen_wakes_on_matching_event() {
    let mut rig = rig(&[LISTEN_SOURCE]).await;

    let start = Message::start("listen-flow", "1.0.0", json!({}));
    rig.worker.handle(start).await.unwrap();
    assert_eq!(rig.events.pending_count(), 1);

    // a non-matching event leaves the workflow parked
    let noise = skein_core::CloudEvent::from_attributes(
        json!({"source": "shop", "type": "invoice.sent"})
            .as_object()
            .unwrap()
            .clone(),
        chrono::Utc::now(),
        &Position::root(),
    )
    .unwrap();
    assert_eq!(rig.events.notify(&noise).await, 0);

    let order = skein_core::CloudEvent::from_attributes(
        json!({
            "source": "shop",
            "type": "order.placed",
            "data": {"id": "o-42"}
        })
        .as_object()
        .unwrap()
        .clone(),
        chrono::Utc::now(),
        &Position::root(),
    )
    .unwrap();
    assert_eq!(rig.events.notify(&order).await, 1);

    let delivery = rig.input_consumer.next().await.unwrap().unwrap();
    rig.worker.handle(delivery.message).await.unwrap();

    let terminal = rig.output_consumer.next().await.unwrap().unwrap().message;
    assert_eq!(terminal.status, WorkflowStatus::Completed);
    assert_eq!(terminal.output, Some(json!({"confirmed": "o-42"})));
}

#[tokio::test]
async fn test_unknown_definition_faults() {
    let mut rig = rig(&[]).await;

    let start = Message::start("ghost", "9.9.9", json!({}));
    rig.worker.handle(start).await.unwrap();

    let terminal = rig.output_consumer.next().await.unwrap().unwrap().message;
    assert_eq!(terminal.status, WorkflowStatus::Faulted);
    let error = terminal.error.unwrap();
    assert!(error.error_type.ends_with("/configuration"));
}

// P6: under concurrent processors every due row is claimed by at most
// one worker
#[tokio::test]
async fn test_concurrent_claiming_is_exclusive() {
    let outbox = Arc::new(InMemoryOutboxStore::new());
    let mut expected = HashSet::new();
    for i in 0..50 {
        let message = Message::start("w", "1.0.0", json!({"n": i}));
        let entry = OutboxEntry::schedule(
            &message,
            chrono::Duration::milliseconds(-10),
            chrono::Utc::now(),
        )
        .unwrap();
        expected.insert(entry.id);
        outbox.insert(&[entry]).await.unwrap();
    }

    let seen: Arc<Mutex<Vec<uuid::Uuid>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for _worker in 0..8 {
        let outbox = outbox.clone();
        let seen = seen.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let seen = seen.clone();
                let batch = outbox
                    .process_due(3, 4, &move |entry| {
                        let seen = seen.clone();
                        Box::pin(async move {
                            seen.lock().push(entry.id);
                            Ok(())
                        })
                    })
                    .await
                    .unwrap();
                if batch.claimed == 0 {
                    break;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let dispatched = seen.lock();
    assert_eq!(dispatched.len(), 50, "every row dispatched exactly once");
    let unique: HashSet<_> = dispatched.iter().copied().collect();
    assert_eq!(unique.len(), 50, "no row dispatched twice");
    assert_eq!(unique, expected);
}
