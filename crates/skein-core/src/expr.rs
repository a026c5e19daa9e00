//! Runtime expression evaluation
//!
//! Expressions are jq programs evaluated with the jaq toolchain. Three
//! input forms are accepted wherever the DSL takes an expression value:
//! an explicit `${ ... }` string, a plain literal, or a template object
//! whose string leaves may embed `${ ... }` expressions. Fields that are
//! runtime expressions by definition (`if`, `while`, `when`, `in`, ...)
//! also accept bare jq source without the marker.

use jaq_core::{load, Compiler, Ctx, RcIter};
use jaq_json::Val;
use serde_json::Value;

use crate::error::WorkflowError;
use crate::scope::Scope;
use crate::tree::Position;

/// Strip the `${ ... }` marker, if present
pub fn as_marked_expression(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("${")?.strip_suffix('}')?;
    Some(inner.trim())
}

/// Evaluate raw jq source against an input value under a scope
///
/// Returns the first produced value; an expression that produces nothing
/// yields `null`.
pub fn evaluate(
    source: &str,
    input: &Value,
    scope: &Scope,
    at: &Position,
) -> Result<Value, WorkflowError> {
    let (names, values): (Vec<String>, Vec<Val>) = scope
        .bindings()
        .map(|(name, value)| (format!("${name}"), Val::from(value.clone())))
        .unzip();

    let program = load::File {
        code: source,
        path: (),
    };
    let loader = load::Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let arena = load::Arena::default();
    let modules = loader.load(&arena, program).map_err(|errors| {
        WorkflowError::expression(at, format!("failed to parse {source:?}: {errors:?}"))
    })?;

    let filter = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .with_global_vars(names.iter().map(String::as_str))
        .compile(modules)
        .map_err(|errors| {
            WorkflowError::expression(at, format!("failed to compile {source:?}: {errors:?}"))
        })?;

    let inputs = RcIter::new(core::iter::empty());
    let ctx = Ctx::new(values, &inputs);
    let mut outputs = filter.run((ctx, Val::from(input.clone())));

    match outputs.next() {
        None => Ok(Value::Null),
        Some(Ok(val)) => Ok(Value::from(val)),
        Some(Err(e)) => Err(WorkflowError::expression(
            at,
            format!("{source:?} failed: {e}"),
        )),
    }
}

/// Evaluate an expression-by-definition field: `${ ... }` or bare source
pub fn evaluate_field(
    source: &str,
    input: &Value,
    scope: &Scope,
    at: &Position,
) -> Result<Value, WorkflowError> {
    let src = as_marked_expression(source).unwrap_or(source);
    evaluate(src, input, scope, at)
}

/// Evaluate any expression-valued DSL node: marked string, template
/// object/array, or plain literal
pub fn evaluate_value(
    value: &Value,
    input: &Value,
    scope: &Scope,
    at: &Position,
) -> Result<Value, WorkflowError> {
    match value {
        Value::String(s) => match as_marked_expression(s) {
            Some(src) => evaluate(src, input, scope, at),
            None => Ok(value.clone()),
        },
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), evaluate_value(v, input, scope, at)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for v in items {
                out.push(evaluate_value(v, input, scope, at)?);
            }
            Ok(Value::Array(out))
        }
        _ => Ok(value.clone()),
    }
}

/// Evaluate a condition field to a boolean
///
/// Only `true`/`false` results are accepted; anything else is an
/// expression error, not a truthiness coercion.
pub fn evaluate_bool(
    source: &str,
    input: &Value,
    scope: &Scope,
    at: &Position,
) -> Result<bool, WorkflowError> {
    match evaluate_field(source, input, scope, at)? {
        Value::Bool(b) => Ok(b),
        other => Err(WorkflowError::expression(
            at,
            format!("{source:?} must evaluate to a boolean, got {other}"),
        )),
    }
}

/// Evaluate a field that must produce a list
pub fn evaluate_list(
    source: &str,
    input: &Value,
    scope: &Scope,
    at: &Position,
) -> Result<Vec<Value>, WorkflowError> {
    match evaluate_field(source, input, scope, at)? {
        Value::Array(items) => Ok(items),
        other => Err(WorkflowError::expression(
            at,
            format!("{source:?} must evaluate to a list, got {other}"),
        )),
    }
}

/// Evaluate a field that must produce a string
pub fn evaluate_string(
    source: &str,
    input: &Value,
    scope: &Scope,
    at: &Position,
) -> Result<String, WorkflowError> {
    match evaluate_field(source, input, scope, at)? {
        Value::String(s) => Ok(s),
        other => Err(WorkflowError::expression(
            at,
            format!("{source:?} must evaluate to a string, got {other}"),
        )),
    }
}
