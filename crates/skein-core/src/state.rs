//! Per-position runtime state
//!
//! One `NodeState` per populated position, carried inside continuation
//! messages. The wire form uses single-letter keys to keep messages
//! small; unknown keys are ignored on decode so newer engines can add
//! fields without breaking older consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::WorkflowError;

/// Mutable state of one node position
///
/// Only the fields a task kind actually uses are populated; absent
/// fields are omitted from the wire form entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Input as handed to the node, before validation/transformation
    #[serde(default, rename = "i", skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,

    /// Input after `input.from`
    #[serde(default, rename = "t", skip_serializing_if = "Option::is_none")]
    pub transformed_input: Option<Value>,

    /// Output produced by the task body
    #[serde(default, rename = "o", skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<Value>,

    /// Output after `output.as`
    #[serde(default, rename = "u", skip_serializing_if = "Option::is_none")]
    pub transformed_output: Option<Value>,

    /// Current child of a sequential composite
    #[serde(default, rename = "c", skip_serializing_if = "Option::is_none")]
    pub child_index: Option<usize>,

    /// When the node started
    #[serde(default, rename = "s", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Scope variables contributed by this node (loop item/index,
    /// caught error alias)
    #[serde(default, rename = "v", skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,

    /// Workflow-global context; root state only
    #[serde(default, rename = "x", skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    /// Workflow identifier; root state only
    #[serde(default, rename = "w", skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,

    /// Try: retry attempts consumed so far
    #[serde(default, rename = "a", skip_serializing_if = "Option::is_none")]
    pub attempt_index: Option<u32>,

    /// Try: delay of the most recently scheduled retry
    #[serde(default, rename = "d", skip_serializing_if = "Option::is_none")]
    pub next_delay_ms: Option<u64>,

    /// Try: the error being retried or handled
    #[serde(default, rename = "e", skip_serializing_if = "Option::is_none")]
    pub caught_error: Option<WorkflowError>,

    /// For: index of the iteration currently executing
    #[serde(default, rename = "f", skip_serializing_if = "Option::is_none")]
    pub iteration_cursor: Option<usize>,

    /// Listen: events consumed so far
    #[serde(default, rename = "g", skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Value>>,
}

impl NodeState {
    /// Fresh state seeded with a raw input
    pub fn with_raw_input(input: Value) -> Self {
        Self {
            raw_input: Some(input),
            ..Default::default()
        }
    }

    /// Whether the node has passed its input contract (started running)
    pub fn is_started(&self) -> bool {
        self.transformed_input.is_some()
    }

    /// Reset everything except the raw input, for re-entry (retry, next
    /// loop iteration)
    pub fn reset_for_rerun(&mut self) {
        let raw_input = self.raw_input.take();
        *self = Self {
            raw_input,
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_all_fields() {
        let state = NodeState {
            raw_input: Some(json!({"a": 1})),
            transformed_input: Some(json!([1, 2, null])),
            raw_output: Some(json!("text")),
            transformed_output: Some(json!(3.5)),
            child_index: Some(2),
            started_at: Some("2026-03-01T12:00:00Z".parse().unwrap()),
            variables: {
                let mut m = Map::new();
                m.insert("item".into(), json!(7));
                m.insert("index".into(), json!(0));
                m
            },
            context: Some(json!({"seen": true})),
            workflow_id: Some(Uuid::now_v7()),
            attempt_index: Some(1),
            next_delay_ms: Some(1500),
            caught_error: None,
            iteration_cursor: Some(0),
            events: Some(vec![json!({"type": "t"})]),
        };
        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: NodeState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(state, decoded);
    }

    #[test]
    fn test_compact_keys() {
        let state = NodeState::with_raw_input(json!(5));
        let encoded = serde_json::to_value(&state).unwrap();
        assert_eq!(encoded, json!({"i": 5}));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let decoded: NodeState =
            serde_json::from_value(json!({"i": 1, "zz": {"future": true}})).unwrap();
        assert_eq!(decoded.raw_input, Some(json!(1)));
    }

    #[test]
    fn test_reset_for_rerun_keeps_raw_input() {
        let mut state = NodeState::with_raw_input(json!({"x": 1}));
        state.transformed_input = Some(json!({"x": 1}));
        state.child_index = Some(3);
        state.reset_for_rerun();
        assert_eq!(state.raw_input, Some(json!({"x": 1})));
        assert!(state.transformed_input.is_none());
        assert!(state.child_index.is_none());
    }
}
