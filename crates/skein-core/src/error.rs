//! Workflow error model
//!
//! Errors raised during an advancement are structured values carrying a
//! closed taxonomy of `type` URIs plus the position pointer of the raising
//! node. They bubble up the parent chain until a Try catches them or the
//! workflow faults.

use serde::{Deserialize, Serialize};

use crate::tree::Position;

/// Base URI for the error taxonomy
pub const ERROR_TYPE_BASE: &str = "https://serverlessworkflow.io/spec/1.0.0/errors";

/// Closed set of error kinds recognized by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed workflow (unknown token, missing `then` target, bad config)
    Configuration,

    /// Schema mismatch at one of the four validation gates
    Validation,

    /// Expression evaluation failure
    Expression,

    /// External call transport/protocol failure
    Communication,

    /// 401-class failure on an external call
    Authentication,

    /// 403-class failure on an external call
    Authorization,

    /// Task or workflow exceeded its allotted duration
    Timeout,

    /// Internal unexpected error
    Runtime,
}

impl ErrorKind {
    /// The taxonomy URI for this kind
    pub fn uri(&self) -> String {
        format!("{ERROR_TYPE_BASE}/{}", self.slug())
    }

    /// Short name used as the last URI segment
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::Expression => "expression",
            Self::Communication => "communication",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Timeout => "timeout",
            Self::Runtime => "runtime",
        }
    }

    /// Default HTTP-ish status for the kind
    pub fn default_status(&self) -> u16 {
        match self {
            Self::Configuration => 400,
            Self::Validation => 400,
            Self::Expression => 400,
            Self::Communication => 500,
            Self::Authentication => 401,
            Self::Authorization => 403,
            Self::Timeout => 408,
            Self::Runtime => 500,
        }
    }
}

/// A structured workflow error
///
/// Shaped after RFC 7807 problem details: `type` is a URI from the closed
/// taxonomy (or a user-supplied URI for raised errors), `instance` is the
/// position pointer of the raising node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    /// Taxonomy URI
    #[serde(rename = "type")]
    pub error_type: String,

    /// Status code
    pub status: u16,

    /// Short human-readable summary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Longer description of this occurrence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Position pointer of the raising node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl WorkflowError {
    /// Create an error of the given kind at the given position
    pub fn new(kind: ErrorKind, at: &Position, detail: impl Into<String>) -> Self {
        Self {
            error_type: kind.uri(),
            status: kind.default_status(),
            title: Some(kind.slug().to_string()),
            detail: Some(detail.into()),
            instance: Some(at.to_string()),
        }
    }

    /// Configuration error helper
    pub fn configuration(at: &Position, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, at, detail)
    }

    /// Validation error helper
    pub fn validation(at: &Position, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, at, detail)
    }

    /// Expression error helper
    pub fn expression(at: &Position, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expression, at, detail)
    }

    /// Communication error helper with an explicit status
    pub fn communication(at: &Position, status: u16, detail: impl Into<String>) -> Self {
        Self {
            error_type: ErrorKind::Communication.uri(),
            status,
            title: Some(ErrorKind::Communication.slug().to_string()),
            detail: Some(detail.into()),
            instance: Some(at.to_string()),
        }
    }

    /// Timeout error helper
    pub fn timeout(at: &Position, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, at, detail)
    }

    /// Runtime error helper
    pub fn runtime(at: &Position, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, at, detail)
    }

    /// Set the status code
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Stamp the raising position if it is not already set
    pub fn at(mut self, position: &Position) -> Self {
        if self.instance.is_none() {
            self.instance = Some(position.to_string());
        }
        self
    }

    /// Whether the error's type URI names the given kind
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.error_type == kind.uri()
    }

    /// The error as a JSON value, for binding into expression scopes
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.error_type, self.status)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        if let Some(instance) = &self.instance {
            write!(f, " at {instance}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_uri() {
        assert_eq!(
            ErrorKind::Communication.uri(),
            "https://serverlessworkflow.io/spec/1.0.0/errors/communication"
        );
    }

    #[test]
    fn test_instance_points_at_raising_node() {
        let pos = Position::parse("/do/2/call-api").unwrap();
        let err = WorkflowError::communication(&pos, 502, "bad gateway");
        assert_eq!(err.instance.as_deref(), Some("/do/2/call-api"));
        assert_eq!(err.status, 502);
        assert!(err.is_kind(ErrorKind::Communication));
    }

    #[test]
    fn test_at_does_not_overwrite() {
        let origin = Position::parse("/do/0/a").unwrap();
        let outer = Position::parse("/do/1/b").unwrap();
        let err = WorkflowError::validation(&origin, "nope").at(&outer);
        assert_eq!(err.instance.as_deref(), Some("/do/0/a"));
    }

    #[test]
    fn test_serde_round_trip() {
        let pos = Position::parse("/do/0/x").unwrap();
        let err = WorkflowError::expression(&pos, "boom");
        let json = serde_json::to_string(&err).unwrap();
        let back: WorkflowError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
