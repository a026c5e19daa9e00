//! End-to-end scenarios driven through the kernel alone
//!
//! Timed resumptions are simulated by feeding the scheduled message back
//! into the executor, standing in for the outbox.

use std::sync::Arc;

use serde_json::json;

use skein_core::prelude::*;
use skein_core::tree::NodeTree;

fn executor_for(source: &str) -> WorkflowExecutor {
    let doc = Arc::new(WorkflowDocument::parse(source).unwrap());
    let tree = Arc::new(NodeTree::build(doc).unwrap());
    WorkflowExecutor::new(tree)
}

#[tokio::test]
async fn test_set_pipeline() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: set-pipeline
  version: "1.0.0"
input:
  from: "${ {v: .} }"
do:
  - a:
      set:
        v: "${ .v + 1 }"
  - b:
      set:
        v: "${ .v + 1 }"
output:
  as: "${ .v }"
"#,
    );

    let outcome = executor.start(json!(5)).await.unwrap();
    let AdvanceOutcome::Completed { message, output } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!(7));
    assert_eq!(message.status, WorkflowStatus::Completed);
    assert_eq!(message.output, Some(json!(7)));
}

#[tokio::test]
async fn test_for_sum() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: for-sum
  version: "1.0.0"
do:
  - sum:
      for:
        in: ".list"
      do:
        - acc:
            set:
              total: "${ .total + $item }"
      output:
        as: ".total"
"#,
    );

    let outcome = executor
        .start(json!({"list": [1, 2, 3], "total": 0}))
        .await
        .unwrap();
    let AdvanceOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!(6));
}

#[tokio::test]
async fn test_for_with_aliases_and_while() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: for-while
  version: "1.0.0"
do:
  - collect:
      for:
        each: entry
        in: ".items"
        at: slot
      while: "${ .count < 2 }"
      do:
        - bump:
            set:
              count: "${ .count + 1 }"
              last: "${ $entry }"
              lastIndex: "${ $slot }"
"#,
    );

    let outcome = executor
        .start(json!({"items": ["a", "b", "c", "d"], "count": 0}))
        .await
        .unwrap();
    let AdvanceOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!({"count": 2, "last": "b", "lastIndex": 1}));
}

#[tokio::test]
async fn test_switch_then() {
    let source = r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: switch-then
  version: "1.0.0"
do:
  - pick:
      switch:
        - low:
            when: '${ . == "low" }'
            then: goLow
        - mid:
            when: '${ . == "mid" }'
            then: goMid
        - other:
            then: goHigh
  - goHigh:
      set:
        out: high2
      then: end
  - goMid:
      set:
        out: mid2
      then: end
  - goLow:
      set:
        out: low2
      then: end
output:
  as: ".out"
"#;

    let executor = executor_for(source);
    let outcome = executor.start(json!("low")).await.unwrap();
    let AdvanceOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!("low2"));

    // the fallback case behaves as continue into the next sibling
    let executor = executor_for(source);
    let outcome = executor.start(json!("anything-else")).await.unwrap();
    let AdvanceOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!("high2"));
}

#[tokio::test]
async fn test_try_catch_by_status() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: try-catch
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
        do:
          - mark:
              set:
                caught: true
"#,
    );

    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Completed { message, output } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output["caught"], json!(true));
    assert_eq!(message.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_catch_error_bound_in_scope() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: catch-as
  version: "1.0.0"
do:
  - guarded:
      try:
        - boom:
            raise:
              error:
                type: https://serverlessworkflow.io/spec/1.0.0/errors/runtime
                status: 503
                detail: backend down
      catch:
        as: oops
        do:
          - report:
              set:
                status: "${ $oops.status }"
                detail: "${ $oops.detail }"
"#,
    );

    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!({"status": 503, "detail": "backend down"}));
}

#[tokio::test]
async fn test_try_retry_exhaustion() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: retry-exhaustion
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
"#,
    );

    // first advancement: error caught, first retry scheduled 1s out
    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Scheduled { message, delay } = outcome else {
        panic!("expected a scheduled retry, got {outcome:?}");
    };
    assert_eq!(delay.num_milliseconds(), 1_000);
    assert_eq!(message.status, WorkflowStatus::Waiting);
    assert_eq!(message.position, "/do/0/guarded/try");
    let try_state = message.states.get("/do/0/guarded").unwrap();
    assert_eq!(try_state.attempt_index, Some(1));

    // second advancement: same failure, second and last retry
    let outcome = executor.advance(message).await.unwrap();
    let AdvanceOutcome::Scheduled { message, delay } = outcome else {
        panic!("expected a second scheduled retry, got {outcome:?}");
    };
    assert_eq!(delay.num_milliseconds(), 1_000);
    let try_state = message.states.get("/do/0/guarded").unwrap();
    assert_eq!(try_state.attempt_index, Some(2));

    // third advancement: attempts exhausted, the original error faults
    // the workflow
    let outcome = executor.advance(message).await.unwrap();
    let AdvanceOutcome::Faulted { message, error } = outcome else {
        panic!("expected a fault, got {outcome:?}");
    };
    assert_eq!(message.status, WorkflowStatus::Faulted);
    assert_eq!(error.status, 500);
    assert_eq!(
        error.error_type,
        "https://serverlessworkflow.io/spec/1.0.0/errors/not-implemented"
    );
    assert_eq!(error.instance.as_deref(), Some("/do/0/guarded/try/0/boom"));
}

#[tokio::test]
async fn test_wait_durability() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: wait-then-set
  version: "1.0.0"
do:
  - w:
      wait: PT30S
  - s:
      set:
        done: true
"#,
    );

    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Scheduled { message, delay } = outcome else {
        panic!("expected a scheduled wait, got {outcome:?}");
    };
    assert_eq!(delay.num_seconds(), 30);
    assert_eq!(message.position, "/do/0/w");
    assert_eq!(message.status, WorkflowStatus::Waiting);

    // the scheduler re-emits the message once due; consuming it resumes
    // past the wait and runs the rest of the workflow
    let outcome = executor.advance(message).await.unwrap();
    let AdvanceOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!({"done": true}));
}

#[tokio::test]
async fn test_fork_joins_all_branches() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: fork-join
  version: "1.0.0"
do:
  - parallel:
      fork:
        branches:
          - left:
              set:
                side: left
          - right:
              set:
                side: right
"#,
    );

    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(
        output,
        json!({"left": {"side": "left"}, "right": {"side": "right"}})
    );
}

#[tokio::test]
async fn test_fork_compete_takes_first() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: fork-compete
  version: "1.0.0"
do:
  - race:
      fork:
        compete: true
        branches:
          - fast:
              set:
                winner: fast
          - slow:
              set:
                winner: slow
"#,
    );

    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!({"winner": "fast"}));
}

#[tokio::test]
async fn test_if_skips_task() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: if-skip
  version: "1.0.0"
do:
  - maybe:
      if: "${ .run }"
      set:
        ran: true
  - always:
      set:
        finished: true
"#,
    );

    let outcome = executor.start(json!({"run": false})).await.unwrap();
    let AdvanceOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    // the skipped task passes its input through untouched
    assert_eq!(output, json!({"finished": true}));
}

#[tokio::test]
async fn test_exit_directive_completes_composite() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: exit-directive
  version: "1.0.0"
do:
  - outer:
      do:
        - first:
            set:
              step: one
            then: exit
        - unreachable:
            set:
              step: two
  - after:
      set:
        sealed: "${ .step }"
"#,
    );

    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Completed { output, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output, json!({"sealed": "one"}));
}

#[tokio::test]
async fn test_raise_from_catalog_with_overrides() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: raise-catalog
  version: "1.0.0"
use:
  errors:
    backendDown:
      type: https://serverlessworkflow.io/spec/1.0.0/errors/communication
      status: 502
      title: backend down
do:
  - fail:
      raise:
        error: backendDown
        with:
          detail: "${ \"order \" + .orderId }"
"#,
    );

    let outcome = executor.start(json!({"orderId": "o-1"})).await.unwrap();
    let AdvanceOutcome::Faulted { error, .. } = outcome else {
        panic!("expected a fault, got {outcome:?}");
    };
    assert_eq!(error.status, 502);
    assert_eq!(error.detail.as_deref(), Some("order o-1"));
    assert_eq!(error.instance.as_deref(), Some("/do/0/fail"));
}

#[tokio::test]
async fn test_terminal_message_is_rejected() {
    let executor = executor_for(
        r#"
document:
  dsl: "1.0.0"
  namespace: tests
  name: reject-terminal
  version: "1.0.0"
do:
  - only:
      set:
        ok: true
"#,
    );

    let outcome = executor.start(json!({})).await.unwrap();
    let AdvanceOutcome::Completed { message, .. } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    let err = executor.advance(message).await.unwrap_err();
    assert!(matches!(err, ExecutorError::AlreadyTerminal(_)));
}
