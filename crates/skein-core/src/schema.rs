//! Schema validation gates
//!
//! Four gates per node (§ data-flow contract): raw input, transformed
//! output, and the export context, each against an inline JSON Schema.
//! A rejected value surfaces as a `validation` error carrying the gate
//! name and the first few schema violations.

use serde_json::Value;

use crate::dsl::SchemaClause;
use crate::error::WorkflowError;
use crate::tree::Position;

/// Which gate is being applied, for error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Input,
    Output,
    Export,
}

impl Gate {
    fn name(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Export => "export",
        }
    }
}

/// Validate `value` against the clause's schema document
///
/// A clause with an unrecognized `format` is a configuration error; a
/// schema that itself fails to compile is too.
pub fn validate(
    clause: &SchemaClause,
    value: &Value,
    gate: Gate,
    at: &Position,
) -> Result<(), WorkflowError> {
    if let Some(format) = &clause.format {
        if format != "json" {
            return Err(WorkflowError::configuration(
                at,
                format!("unsupported schema format {format:?}"),
            ));
        }
    }

    let validator = jsonschema::validator_for(&clause.document).map_err(|e| {
        WorkflowError::configuration(at, format!("invalid {} schema: {e}", gate.name()))
    })?;

    let violations: Vec<String> = validator
        .iter_errors(value)
        .take(3)
        .map(|e| e.to_string())
        .collect();
    if violations.is_empty() {
        return Ok(());
    }
    Err(WorkflowError::validation(
        at,
        format!("{} schema rejected value: {}", gate.name(), violations.join("; ")),
    ))
}
