//! Continuation messages
//!
//! A message is the durable form of a workflow instance at rest: the
//! workflow coordinates, the per-position state map, and the active
//! position that will run (or resume) next. Messages are self-describing
//! and carry no engine identity; consuming one uniquely resumes the
//! instance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::state::NodeState;
use crate::tree::Position;

/// Lifecycle status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but never advanced
    Pending,

    /// An advancement is in progress or queued
    #[default]
    Running,

    /// Parked at a suspension point (wait, retry, listen)
    Waiting,

    /// Terminal: completed successfully
    Completed,

    /// Terminal: failed with an error
    Faulted,

    /// Terminal: cancelled
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the status is terminal (sticky)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Faulted | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Faulted => "faulted",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

fn is_running(status: &WorkflowStatus) -> bool {
    *status == WorkflowStatus::Running
}

/// Wire form of a continuation: `{n, v, s, p}` plus terminal extras
///
/// The states map is keyed by position strings and kept sorted so that
/// encoding is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Workflow name
    #[serde(rename = "n")]
    pub name: String,

    /// Workflow version
    #[serde(rename = "v")]
    pub version: String,

    /// Position string -> node state, populated positions only
    #[serde(rename = "s")]
    pub states: BTreeMap<String, NodeState>,

    /// Active position
    #[serde(rename = "p")]
    pub position: String,

    /// Instance status; omitted while running
    #[serde(default, rename = "u", skip_serializing_if = "is_running")]
    pub status: WorkflowStatus,

    /// Originating error; terminal faulted messages only
    #[serde(default, rename = "e", skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,

    /// Final output; terminal completed messages only
    #[serde(default, rename = "o", skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl Message {
    /// Initial message for a new instance: only the root state, seeded
    /// with the input payload and a fresh time-ordered id
    pub fn start(name: &str, version: &str, input: Value) -> Self {
        let mut root = NodeState::with_raw_input(input);
        root.workflow_id = Some(Uuid::now_v7());
        let mut states = BTreeMap::new();
        states.insert(Position::root().to_string(), root);
        Self {
            name: name.to_string(),
            version: version.to_string(),
            states,
            position: Position::root().to_string(),
            status: WorkflowStatus::Pending,
            error: None,
            output: None,
        }
    }

    /// Decode from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageCodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode to the wire
    pub fn encode(&self) -> Result<Vec<u8>, MessageCodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The active position, parsed
    pub fn active_position(&self) -> Result<Position, MessageCodecError> {
        Position::parse(&self.position)
            .map_err(|e| MessageCodecError::Position(self.position.clone(), e.to_string()))
    }

    /// The workflow id carried in the root state
    pub fn workflow_id(&self) -> Option<Uuid> {
        self.states
            .get(&Position::root().to_string())
            .and_then(|s| s.workflow_id)
    }
}

/// Message codec failures
#[derive(Debug, thiserror::Error)]
pub enum MessageCodecError {
    /// Not valid JSON or not a message
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// Active position string did not parse
    #[error("malformed active position {0:?}: {1}")]
    Position(String, String),
}
