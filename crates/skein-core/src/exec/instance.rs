//! Decoded working form of a workflow instance
//!
//! An advancement decodes the continuation message into this mutable
//! form, drives the tree, and re-encodes. States are keyed by position
//! string; the map stays sorted so re-encoding is deterministic.

use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

use crate::message::{Message, MessageCodecError, WorkflowStatus};
use crate::state::NodeState;
use crate::tree::Position;

/// A workflow instance under advancement
#[derive(Debug, Clone)]
pub struct WorkflowInstance {
    pub name: String,
    pub version: String,
    pub states: BTreeMap<String, NodeState>,
    pub active: Position,
    pub status: WorkflowStatus,
}

impl WorkflowInstance {
    /// Decode from a continuation message
    pub fn from_message(message: &Message) -> Result<Self, MessageCodecError> {
        Ok(Self {
            name: message.name.clone(),
            version: message.version.clone(),
            states: message.states.clone(),
            active: message.active_position()?,
            status: message.status,
        })
    }

    /// Encode back into a message
    pub fn to_message(&self) -> Message {
        Message {
            name: self.name.clone(),
            version: self.version.clone(),
            states: self.states.clone(),
            position: self.active.to_string(),
            status: self.status,
            error: None,
            output: None,
        }
    }

    /// State at a position, if populated
    pub fn state(&self, position: &Position) -> Option<&NodeState> {
        self.states.get(&position.to_string())
    }

    /// Mutable state at a position, created empty if absent
    pub fn state_mut(&mut self, position: &Position) -> &mut NodeState {
        self.states.entry(position.to_string()).or_default()
    }

    /// Whether a position has started (passed its input contract)
    pub fn is_started(&self, position: &Position) -> bool {
        self.state(position).map(NodeState::is_started).unwrap_or(false)
    }

    /// The root state
    pub fn root_state(&self) -> Option<&NodeState> {
        self.state(&Position::root())
    }

    /// Mutable root state
    pub fn root_state_mut(&mut self) -> &mut NodeState {
        self.state_mut(&Position::root())
    }

    /// Workflow identifier carried in the root state
    pub fn workflow_id(&self) -> Option<Uuid> {
        self.root_state().and_then(|s| s.workflow_id)
    }

    /// Workflow-global context (root state), defaulting to `{}`
    pub fn context(&self) -> Value {
        self.root_state()
            .and_then(|s| s.context.clone())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }

    /// Remove all states strictly below `position`
    ///
    /// Used when a subtree is re-entered (retry, next loop iteration);
    /// the position's own state is left to the caller.
    pub fn remove_descendants(&mut self, position: &Position) {
        let keys: Vec<String> = self
            .states
            .keys()
            .filter(|key| {
                Position::parse(key)
                    .map(|p| position.is_prefix_of(&p) && p != *position)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for key in keys {
            self.states.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_round_trip() {
        let msg = Message::start("w", "1.0.0", json!({"a": 1}));
        let inst = WorkflowInstance::from_message(&msg).unwrap();
        assert_eq!(inst.status, WorkflowStatus::Pending);
        assert!(inst.workflow_id().is_some());
        let back = inst.to_message();
        assert_eq!(back.states, msg.states);
        assert_eq!(back.position, msg.position);
    }

    #[test]
    fn test_remove_descendants_keeps_self_and_others() {
        let msg = Message::start("w", "1.0.0", json!(null));
        let mut inst = WorkflowInstance::from_message(&msg).unwrap();
        let body = Position::parse("/do/0/loop/do").unwrap();
        inst.state_mut(&body).raw_input = Some(json!(1));
        inst.state_mut(&Position::parse("/do/0/loop/do/0/step").unwrap())
            .raw_input = Some(json!(2));
        inst.state_mut(&Position::parse("/do/1/after").unwrap())
            .raw_input = Some(json!(3));

        inst.remove_descendants(&body);

        assert!(inst.state(&body).is_some());
        assert!(inst
            .state(&Position::parse("/do/0/loop/do/0/step").unwrap())
            .is_none());
        assert!(inst.state(&Position::parse("/do/1/after").unwrap()).is_some());
    }

    #[test]
    fn test_context_defaults_to_empty_object() {
        let msg = Message::start("w", "1.0.0", json!(null));
        let inst = WorkflowInstance::from_message(&msg).unwrap();
        assert_eq!(inst.context(), json!({}));
    }
}
