//! Flow directives
//!
//! A `then` clause controls where execution goes after a task completes:
//! one of the keywords `continue`, `exit`, `end`, or the name of a sibling
//! task.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where to go after a task completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowDirective {
    /// Proceed to the next sibling in declaration order
    Continue,

    /// Exit the enclosing composite
    Exit,

    /// Terminate the workflow successfully
    End,

    /// Jump to the named sibling
    Next(String),
}

impl FlowDirective {
    /// Parse from the DSL string form
    pub fn from_str_form(s: &str) -> Self {
        match s {
            "continue" => Self::Continue,
            "exit" => Self::Exit,
            "end" => Self::End,
            other => Self::Next(other.to_string()),
        }
    }
}

impl fmt::Display for FlowDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Exit => write!(f, "exit"),
            Self::End => write!(f, "end"),
            Self::Next(name) => write!(f, "{name}"),
        }
    }
}

impl Serialize for FlowDirective {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FlowDirective {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_str_form(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords() {
        assert_eq!(FlowDirective::from_str_form("continue"), FlowDirective::Continue);
        assert_eq!(FlowDirective::from_str_form("exit"), FlowDirective::Exit);
        assert_eq!(FlowDirective::from_str_form("end"), FlowDirective::End);
    }

    #[test]
    fn test_sibling_name() {
        assert_eq!(
            FlowDirective::from_str_form("retry-step"),
            FlowDirective::Next("retry-step".to_string())
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let d: FlowDirective = serde_json::from_str("\"end\"").unwrap();
        assert_eq!(d, FlowDirective::End);
        assert_eq!(serde_json::to_string(&d).unwrap(), "\"end\"");
        let n: FlowDirective = serde_json::from_str("\"other\"").unwrap();
        assert_eq!(serde_json::to_string(&n).unwrap(), "\"other\"");
    }
}
