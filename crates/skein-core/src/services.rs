//! External collaborators
//!
//! The kernel touches the outside world through three capabilities:
//! `Caller` performs Call tasks, `EventSink` publishes Emit events, and
//! event subscriptions (Listen) are owned by the runtime, which feeds
//! consumed events back in through the continuation state. Implementations
//! live outside the kernel; the defaults here fail fast so a workflow
//! that needs a collaborator the host did not wire up faults cleanly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::tree::Position;

/// A CloudEvent-shaped record produced by Emit and consumed by Listen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub id: String,

    pub source: String,

    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Extension attributes beyond the core set
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl CloudEvent {
    /// Build an event from evaluated `emit.event.with` attributes
    ///
    /// Missing `id`/`time` are filled in; `source` and `type` are
    /// required by the CloudEvents core set.
    pub fn from_attributes(
        mut attributes: Map<String, Value>,
        now: chrono::DateTime<chrono::Utc>,
        at: &Position,
    ) -> Result<Self, WorkflowError> {
        let id = match attributes.remove("id") {
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(WorkflowError::configuration(
                    at,
                    format!("event id must be a string, got {other}"),
                ))
            }
            None => Uuid::now_v7().to_string(),
        };
        let source = match attributes.remove("source") {
            Some(Value::String(s)) => s,
            _ => {
                return Err(WorkflowError::configuration(
                    at,
                    "event requires a string 'source' attribute",
                ))
            }
        };
        let event_type = match attributes.remove("type") {
            Some(Value::String(s)) => s,
            _ => {
                return Err(WorkflowError::configuration(
                    at,
                    "event requires a string 'type' attribute",
                ))
            }
        };
        let subject = match attributes.remove("subject") {
            Some(Value::String(s)) => Some(s),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(WorkflowError::configuration(
                    at,
                    format!("event subject must be a string, got {other}"),
                ))
            }
        };
        let time = match attributes.remove("time") {
            Some(Value::String(s)) => Some(s.parse().map_err(|e| {
                WorkflowError::configuration(at, format!("invalid event time: {e}"))
            })?),
            Some(Value::Null) | None => Some(now),
            Some(other) => {
                return Err(WorkflowError::configuration(
                    at,
                    format!("event time must be a string, got {other}"),
                ))
            }
        };
        let data = attributes.remove("data");

        Ok(Self {
            id,
            source,
            event_type,
            subject,
            time,
            data,
            extensions: attributes,
        })
    }

    /// The event as a JSON envelope
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Performs Call tasks (http/grpc/openapi/asyncapi/function)
#[async_trait]
pub trait Caller: Send + Sync {
    /// Invoke the named call kind with evaluated arguments
    ///
    /// `with` carries the evaluated `call.with` object; `input` is the
    /// task's transformed input. Failures surface as `communication`,
    /// `authentication`, or `authorization` errors.
    async fn invoke(
        &self,
        kind: &str,
        with: &Value,
        input: &Value,
        at: &Position,
    ) -> Result<Value, WorkflowError>;
}

/// Publishes Emit events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &CloudEvent, at: &Position) -> Result<(), WorkflowError>;
}

/// Caller used when the host wired none up: every invocation is a
/// configuration error
pub struct NoCaller;

#[async_trait]
impl Caller for NoCaller {
    async fn invoke(
        &self,
        kind: &str,
        _with: &Value,
        _input: &Value,
        at: &Position,
    ) -> Result<Value, WorkflowError> {
        Err(WorkflowError::configuration(
            at,
            format!("no caller configured for call kind {kind:?}"),
        ))
    }
}

/// Sink used when the host wired none up: emissions are logged and
/// dropped
pub struct NoEventSink;

#[async_trait]
impl EventSink for NoEventSink {
    async fn emit(&self, event: &CloudEvent, _at: &Position) -> Result<(), WorkflowError> {
        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "dropping emitted event, no sink configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at() -> Position {
        Position::parse("/do/0/notify").unwrap()
    }

    #[test]
    fn test_from_attributes_fills_defaults() {
        let attrs = json!({
            "source": "https://tests/emitter",
            "type": "com.example.ping",
            "data": {"n": 1},
            "traceparent": "00-abc"
        });
        let event = CloudEvent::from_attributes(
            attrs.as_object().unwrap().clone(),
            "2026-03-01T00:00:00Z".parse().unwrap(),
            &at(),
        )
        .unwrap();
        assert!(!event.id.is_empty());
        assert_eq!(event.event_type, "com.example.ping");
        assert_eq!(event.extensions.get("traceparent"), Some(&json!("00-abc")));
        assert!(event.time.is_some());
    }

    #[test]
    fn test_missing_type_is_configuration_error() {
        let attrs = json!({"source": "s"});
        let err = CloudEvent::from_attributes(
            attrs.as_object().unwrap().clone(),
            chrono::Utc::now(),
            &at(),
        )
        .unwrap_err();
        assert!(err.error_type.ends_with("/configuration"));
    }

    #[tokio::test]
    async fn test_no_caller_faults() {
        let err = NoCaller
            .invoke("http", &json!({}), &json!(null), &at())
            .await
            .unwrap_err();
        assert!(err.error_type.ends_with("/configuration"));
    }
}
