//! Universal invariants of the kernel

use std::sync::Arc;

use serde_json::{json, Map};

use skein_core::prelude::*;
use skein_core::tree::NodeTree;

fn executor_for(source: &str) -> WorkflowExecutor {
    let doc = Arc::new(WorkflowDocument::parse(source).unwrap());
    let tree = Arc::new(NodeTree::build(doc).unwrap());
    WorkflowExecutor::new(tree)
}

const PIPELINE: &str = r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: pipeline
  version: "1.0.0"
input:
  from: "${ {v: .} }"
do:
  - a:
      set:
        v: "${ .v + 1 }"
  - b:
      set:
        v: "${ .v * 10 }"
output:
  as: "${ .v }"
"#;

// P1: advancing the same message twice under a pinned clock produces the
// same output message
#[tokio::test]
async fn test_determinism() {
    let now = "2026-03-01T12:00:00Z".parse().unwrap();
    let message = Message::start("pipeline", "1.0.0", json!(4));

    let first = executor_for(PIPELINE)
        .with_now(now)
        .advance(message.clone())
        .await
        .unwrap();
    let second = executor_for(PIPELINE)
        .with_now(now)
        .advance(message)
        .await
        .unwrap();

    assert_eq!(
        serde_json::to_value(first.message()).unwrap(),
        serde_json::to_value(second.message()).unwrap()
    );
}

// P2: the state codec round-trips everything the engine produces,
// checked over a full advancement's worth of states
#[tokio::test]
async fn test_state_round_trip() {
    let executor = executor_for(PIPELINE);
    let outcome = executor.start(json!(4)).await.unwrap();
    let message = outcome.message();
    for state in message.states.values() {
        let encoded = serde_json::to_string(state).unwrap();
        let decoded: NodeState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(*state, decoded);
    }
    let bytes = message.encode().unwrap();
    assert_eq!(Message::decode(&bytes).unwrap(), *message);
}

// P4: after an advancement the active position has a populated raw input
#[tokio::test]
async fn test_active_position_has_state() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: waiter
  version: "1.0.0"
do:
  - pause:
      wait: PT1M
  - done:
      set:
        ok: true
"#,
    );
    let outcome = executor.start(json!({"seed": 1})).await.unwrap();
    let message = outcome.message();
    let state = message.states.get(&message.position).unwrap();
    assert!(state.raw_input.is_some());
}

// P5: a rejected input schema means the task body never runs; the raise
// body would produce a different error if it did
#[tokio::test]
async fn test_input_schema_gates_body() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: gated
  version: "1.0.0"
do:
  - explode:
      input:
        schema:
          document:
            type: integer
      raise:
        error:
          type: https://serverlessworkflow.io/spec/1.0.0/errors/runtime
          status: 500
"#,
    );
    let outcome = executor.start(json!("not an integer")).await.unwrap();
    let AdvanceOutcome::Faulted { error, .. } = outcome else {
        panic!("expected a fault, got {outcome:?}");
    };
    assert!(error.error_type.ends_with("/validation"));
    assert_ne!(error.status, 500);
}

// P5 symmetric: output schema gates after the body
#[tokio::test]
async fn test_output_schema_gates_result() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: out-gated
  version: "1.0.0"
do:
  - produce:
      set:
        n: not-a-number
      output:
        schema:
          document:
            type: object
            properties:
              n:
                type: integer
            required: [n]
"#,
    );
    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Faulted { error, .. } = outcome else {
        panic!("expected a fault, got {outcome:?}");
    };
    assert!(error.error_type.ends_with("/validation"));
}

// P7: the instance pointer of a raised error is the raising node
#[tokio::test]
async fn test_error_instance_pointer() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: pointer
  version: "1.0.0"
do:
  - wrap:
      do:
        - inner:
            raise:
              error:
                type: https://serverlessworkflow.io/spec/1.0.0/errors/runtime
                status: 500
"#,
    );
    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Faulted { error, .. } = outcome else {
        panic!("expected a fault, got {outcome:?}");
    };
    assert_eq!(error.instance.as_deref(), Some("/do/0/wrap/do/0/inner"));
}

// P8: secret values are usable inside expressions but cannot be
// exported into the durable context
#[tokio::test]
async fn test_secrets_never_exported() {
    let mut secrets = Map::new();
    secrets.insert("apiKey".to_string(), json!("hunter2"));

    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: leak
  version: "1.0.0"
do:
  - leak:
      set:
        ok: true
      export:
        as: "${ {stolen: $secrets.apiKey} }"
"#,
    )
    .with_secrets(secrets.clone());

    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Faulted { message, error } = outcome else {
        panic!("expected a fault, got {outcome:?}");
    };
    assert!(error.error_type.ends_with("/authorization"));
    // the prior context is untouched and the secret is nowhere in the
    // terminal message
    let encoded = String::from_utf8(message.encode().unwrap()).unwrap();
    assert!(!encoded.contains("hunter2"));
}

// P8 complement: secrets are readable by expressions that do not export
#[tokio::test]
async fn test_secrets_usable_in_expressions() {
    let mut secrets = Map::new();
    secrets.insert("apiKey".to_string(), json!("hunter2"));

    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: use-secret
  version: "1.0.0"
do:
  - check:
      set:
        authorized: "${ $secrets.apiKey == \"hunter2\" }"
"#,
    )
    .with_secrets(secrets);

    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!({"authorized": true}));
}

// export replaces the root context and is visible to later expressions
#[tokio::test]
async fn test_export_updates_context() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: exporter
  version: "1.0.0"
do:
  - stash:
      set:
        value: 42
      export:
        as: "${ {stored: .value} }"
  - read:
      set:
        fromContext: "${ $context.stored }"
"#,
    );
    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Completed { message, output } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!({"fromContext": 42}));
    let root = message.states.get("/").unwrap();
    assert_eq!(root.context, Some(json!({"stored": 42})));
}

// export.schema failure faults the workflow and leaves the prior
// context in place
#[tokio::test]
async fn test_export_schema_failure_keeps_context() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: export-gate
  version: "1.0.0"
do:
  - good:
      set:
        v: 1
      export:
        as: "${ {v: .v} }"
  - bad:
      set:
        v: not-a-number
      export:
        schema:
          document:
            type: object
            properties:
              v:
                type: integer
        as: "${ {v: .v} }"
"#,
    );
    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Faulted { message, error } = outcome else {
        panic!("expected a fault, got {outcome:?}");
    };
    assert!(error.error_type.ends_with("/validation"));
    let root = message.states.get("/").unwrap();
    assert_eq!(root.context, Some(json!({"v": 1})));
}

// workflow-level timeout is observed at the next step boundary after
// the deadline passes, here when resuming past a wait
#[tokio::test]
async fn test_workflow_timeout_observed_at_step_boundary() {
    let source = r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: slow
  version: "1.0.0"
timeout:
  after: PT1H
do:
  - pause:
      wait: PT30S
  - finish:
      set:
        ok: true
"#;
    let t0 = "2026-03-01T12:00:00Z".parse().unwrap();

    let outcome = executor_for(source)
        .with_now(t0)
        .start(json!({}))
        .await
        .unwrap();
    let AdvanceOutcome::Scheduled { message, .. } = outcome else {
        panic!("expected a scheduled wait, got {outcome:?}");
    };

    // the timer fires two hours later, past the workflow deadline
    let late = t0 + chrono::Duration::hours(2);
    let outcome = executor_for(source)
        .with_now(late)
        .advance(message)
        .await
        .unwrap();
    let AdvanceOutcome::Faulted { error, .. } = outcome else {
        panic!("expected a timeout fault, got {outcome:?}");
    };
    assert!(error.error_type.ends_with("/timeout"));
}
