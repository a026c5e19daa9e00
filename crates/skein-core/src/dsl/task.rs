//! Task definitions
//!
//! The DSL models a workflow as a tree of typed tasks. Each entry of a
//! `do` list is a single-key map `{name: task}`; the task object's
//! discriminating keyword (`for`, `try`, `switch`, `set`, ...) selects the
//! kind. All kinds share the common pre/post-processing clauses (`input`,
//! `output`, `export`, `if`, `then`, `timeout`).

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::duration::DslDuration;
use super::flow::FlowDirective;

/// Schema attached to an input/output/export clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaClause {
    /// Schema format; only `json` (JSON Schema) is recognized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Inline schema document
    pub document: Value,
}

/// `input` clause: validation schema plus transformation expression
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaClause>,

    /// Expression or template producing the transformed input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Value>,
}

/// `output` clause: transformation expression plus validation schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaClause>,

    /// Expression or template producing the transformed output
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<Value>,
}

/// `export` clause: replaces the workflow-global context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaClause>,

    /// Expression or template producing the new context
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<Value>,
}

/// `timeout` clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutClause {
    pub after: DslDuration,
}

/// Clauses shared by every task kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCommon {
    /// Condition evaluated on the transformed input; false skips the task
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub if_: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputClause>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputClause>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportClause>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutClause>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A named task inside a task list
#[derive(Debug, Clone, PartialEq)]
pub struct TaskItem {
    pub name: String,
    pub task: TaskDefinition,
}

/// An ordered task list (`do`, `try`, `fork.branches`)
///
/// Serialized as a sequence of single-key maps to preserve declaration
/// order, which drives both execution order and position indexes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskList(pub Vec<TaskItem>);

impl TaskList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskItem> {
        self.0.iter()
    }
}

impl Serialize for TaskList {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for item in &self.0 {
            let mut map = IndexMap::with_capacity(1);
            map.insert(item.name.clone(), item.task.clone());
            seq.serialize_element(&map)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for TaskList {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries: Vec<IndexMap<String, TaskDefinition>> = Vec::deserialize(deserializer)?;
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.len() != 1 {
                return Err(D::Error::custom(
                    "each task list entry must be a single-key map {name: task}",
                ));
            }
            for (name, task) in entry {
                items.push(TaskItem { name, task });
            }
        }
        Ok(TaskList(items))
    }
}

/// A single switch case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    /// Condition; a case without `when` always matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Directive applied when the case matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowDirective>,
}

/// Error declaration, inline in `raise` or named in `use.errors`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDeclaration {
    #[serde(rename = "type")]
    pub error_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// `raise.error`: inline declaration or a reference into `use.errors`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RaiseError {
    Reference(String),
    Inline(ErrorDeclaration),
}

/// `raise` clause, with optional `with` overrides applied on top of a
/// catalog reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseClause {
    pub error: RaiseError,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<IndexMap<String, Value>>,
}

/// Structural error filter of a catch clause
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilter {
    /// Fields that must structurally match the raised error; omitted
    /// fields match anything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<ErrorFilterFields>,
}

/// Matchable fields of an error filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilterFields {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// Backoff strategy of a retry policy
///
/// Serialized as `{constant: {}}`, `{linear: {}}`, or `{exponential: {}}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Constant,
    Linear,
    Exponential,
}

/// `backoff` clause wrapper
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackoffClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exponential: Option<Value>,
}

impl BackoffClause {
    pub fn kind(&self) -> BackoffKind {
        if self.exponential.is_some() {
            BackoffKind::Exponential
        } else if self.linear.is_some() {
            BackoffKind::Linear
        } else {
            BackoffKind::Constant
        }
    }
}

/// Retry attempt limit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryLimitAttempt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

/// Retry limits: attempt count and total duration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<RetryLimitAttempt>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<DslDuration>,
}

/// A retry policy, inline in `try.catch.retry` or named in `use.retries`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDefinition {
    /// Base delay before the first retry
    pub delay: DslDuration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffClause>,

    /// Upper bound of the uniform random amount added to each delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<DslDuration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<RetryLimit>,

    /// Retry only when this condition holds for the caught error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Never retry when this condition holds for the caught error
    #[serde(default, rename = "exceptWhen", skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
}

/// `try.catch.retry`: inline policy or a reference into `use.retries`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryRef {
    Reference(String),
    Inline(RetryDefinition),
}

/// `catch` clause of a Try task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorFilter>,

    /// Scope variable name the caught error is bound to (default `error`)
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    #[serde(default, rename = "exceptWhen", skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryRef>,

    #[serde(default, rename = "do", skip_serializing_if = "Option::is_none")]
    pub do_: Option<TaskList>,
}

impl CatchClause {
    pub fn error_var(&self) -> &str {
        self.as_.as_deref().unwrap_or("error")
    }
}

/// `fork` clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkClause {
    pub branches: TaskList,

    /// When true the fork completes with the first branch to finish
    #[serde(default)]
    pub compete: bool,
}

/// Event filter of a Listen task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Attribute values the event must carry; string values may be
    /// expressions evaluated against the event
    #[serde(default)]
    pub with: IndexMap<String, Value>,

    /// Correlation keys extracted from the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlate: Option<IndexMap<String, Correlation>>,
}

/// A single correlation definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    /// Expression extracting the correlation value from the event
    pub from: String,

    /// Expected value (literal or expression); omitted means any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Value>,
}

/// Event consumption strategy: exactly one of `one`, `any`, `all`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ListenTo {
    #[serde(rename = "one")]
    One(EventFilter),

    #[serde(rename = "any")]
    Any(Vec<EventFilter>),

    #[serde(rename = "all")]
    All(Vec<EventFilter>),
}

/// How consumed events are surfaced as the task's raw output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenRead {
    /// Event data attributes only
    #[default]
    Data,

    /// Entire event envelopes
    Envelope,
}

/// `listen` clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenClause {
    pub to: ListenTo,

    #[serde(default)]
    pub read: ListenRead,
}

/// `emit` clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitClause {
    pub event: EmitEvent,
}

/// Event template of an Emit task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitEvent {
    /// CloudEvent attributes; string leaves may embed expressions
    pub with: IndexMap<String, Value>,
}

// =============================================================================
// Task kinds
// =============================================================================

/// Sequential composite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoTask {
    #[serde(rename = "do")]
    pub do_: TaskList,

    #[serde(flatten)]
    pub common: TaskCommon,
}

/// List iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForTask {
    #[serde(rename = "for")]
    pub for_: ForClause,

    /// Loop-continuation condition, checked before each iteration
    #[serde(default, rename = "while", skip_serializing_if = "Option::is_none")]
    pub while_: Option<String>,

    #[serde(rename = "do")]
    pub do_: TaskList,

    #[serde(flatten)]
    pub common: TaskCommon,
}

/// `for` clause of a For task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub each: Option<String>,

    #[serde(rename = "in")]
    pub in_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

impl ForClause {
    pub fn item_var(&self) -> &str {
        self.each.as_deref().unwrap_or("item")
    }

    pub fn index_var(&self) -> &str {
        self.at.as_deref().unwrap_or("index")
    }
}

/// Conditional branch selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchTask {
    /// Cases in declaration order, each a single-key map {name: case}
    pub switch: Vec<IndexMap<String, SwitchCase>>,

    #[serde(flatten)]
    pub common: TaskCommon,
}

/// Parallel branches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkTask {
    pub fork: ForkClause,

    #[serde(flatten)]
    pub common: TaskCommon,
}

/// Error boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryTask {
    #[serde(rename = "try")]
    pub try_: TaskList,

    #[serde(default)]
    pub catch: CatchClause,

    #[serde(flatten)]
    pub common: TaskCommon,
}

/// Data construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTask {
    pub set: Value,

    #[serde(flatten)]
    pub common: TaskCommon,
}

/// Error raising
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseTask {
    pub raise: RaiseClause,

    #[serde(flatten)]
    pub common: TaskCommon,
}

/// Timed suspension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTask {
    pub wait: DslDuration,

    #[serde(flatten)]
    pub common: TaskCommon,
}

/// External invocation (http/grpc/openapi/asyncapi/function)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTask {
    /// Call kind, e.g. `http`
    pub call: String,

    /// Call arguments; string leaves may embed expressions
    #[serde(default)]
    pub with: IndexMap<String, Value>,

    #[serde(flatten)]
    pub common: TaskCommon,
}

/// Event consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenTask {
    pub listen: ListenClause,

    #[serde(flatten)]
    pub common: TaskCommon,
}

/// Event production
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitTask {
    pub emit: EmitClause,

    #[serde(flatten)]
    pub common: TaskCommon,
}

/// The task sum type
///
/// Untagged: the discriminating keyword of each variant selects it. `Do`
/// is tried last because `for`, `try`, and `fork` tasks also carry task
/// lists under a `do` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskDefinition {
    For(ForTask),
    Try(TryTask),
    Fork(ForkTask),
    Switch(SwitchTask),
    Raise(RaiseTask),
    Set(SetTask),
    Wait(WaitTask),
    Call(CallTask),
    Listen(ListenTask),
    Emit(EmitTask),
    Do(DoTask),
}

impl TaskDefinition {
    /// The shared clauses of this task
    pub fn common(&self) -> &TaskCommon {
        match self {
            Self::For(t) => &t.common,
            Self::Try(t) => &t.common,
            Self::Fork(t) => &t.common,
            Self::Switch(t) => &t.common,
            Self::Raise(t) => &t.common,
            Self::Set(t) => &t.common,
            Self::Wait(t) => &t.common,
            Self::Call(t) => &t.common,
            Self::Listen(t) => &t.common,
            Self::Emit(t) => &t.common,
            Self::Do(t) => &t.common,
        }
    }

    /// Kind name, for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::For(_) => "for",
            Self::Try(_) => "try",
            Self::Fork(_) => "fork",
            Self::Switch(_) => "switch",
            Self::Raise(_) => "raise",
            Self::Set(_) => "set",
            Self::Wait(_) => "wait",
            Self::Call(_) => "call",
            Self::Listen(_) => "listen",
            Self::Emit(_) => "emit",
            Self::Do(_) => "do",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_list_preserves_order() {
        let yaml = r#"
- first:
    set:
      a: 1
- second:
    set:
      b: 2
"#;
        let list: TaskList = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.0[0].name, "first");
        assert_eq!(list.0[1].name, "second");
    }

    #[test]
    fn test_for_parses_as_for_not_do() {
        let task: TaskDefinition = serde_json::from_value(json!({
            "for": {"each": "x", "in": ".items"},
            "do": [{"body": {"set": {"y": 1}}}]
        }))
        .unwrap();
        assert!(matches!(task, TaskDefinition::For(_)));
    }

    #[test]
    fn test_try_parses_as_try() {
        let task: TaskDefinition = serde_json::from_value(json!({
            "try": [{"risky": {"set": {"x": 1}}}],
            "catch": {"errors": {"with": {"status": 500}}}
        }))
        .unwrap();
        let TaskDefinition::Try(t) = task else {
            panic!("expected try");
        };
        assert_eq!(
            t.catch.errors.unwrap().with.unwrap().status,
            Some(500)
        );
    }

    #[test]
    fn test_common_clauses_flatten() {
        let task: TaskDefinition = serde_json::from_value(json!({
            "set": {"v": 1},
            "if": ". != null",
            "then": "exit",
            "output": {"as": ".v"}
        }))
        .unwrap();
        let common = task.common();
        assert_eq!(common.if_.as_deref(), Some(". != null"));
        assert_eq!(common.then, Some(FlowDirective::Exit));
        assert_eq!(common.output.as_ref().unwrap().as_, Some(json!(".v")));
    }

    #[test]
    fn test_switch_cases() {
        let task: TaskDefinition = serde_json::from_value(json!({
            "switch": [
                {"low": {"when": ". == \"low\"", "then": "goLow"}},
                {"fallback": {"then": "continue"}}
            ]
        }))
        .unwrap();
        let TaskDefinition::Switch(s) = task else {
            panic!("expected switch");
        };
        assert_eq!(s.switch.len(), 2);
    }

    #[test]
    fn test_listen_strategies() {
        let one: ListenClause = serde_json::from_value(json!({
            "to": {"one": {"with": {"type": "order.placed"}}}
        }))
        .unwrap();
        assert!(matches!(one.to, ListenTo::One(_)));

        let all: ListenClause = serde_json::from_value(json!({
            "to": {"all": [
                {"with": {"type": "a"}},
                {"with": {"type": "b"}}
            ]},
            "read": "envelope"
        }))
        .unwrap();
        assert!(matches!(all.to, ListenTo::All(ref v) if v.len() == 2));
        assert_eq!(all.read, ListenRead::Envelope);
    }

    #[test]
    fn test_retry_definition() {
        let retry: RetryDefinition = serde_json::from_value(json!({
            "delay": "PT1S",
            "backoff": {"exponential": {}},
            "jitter": "PT0.1S",
            "limit": {"attempt": {"count": 3}}
        }))
        .unwrap();
        assert_eq!(retry.backoff.unwrap().kind(), BackoffKind::Exponential);
        assert_eq!(retry.limit.unwrap().attempt.unwrap().count, Some(3));
    }

    #[test]
    fn test_raise_reference_and_inline() {
        let by_ref: RaiseClause =
            serde_json::from_value(json!({"error": "notImplemented"})).unwrap();
        assert!(matches!(by_ref.error, RaiseError::Reference(_)));

        let inline: RaiseClause = serde_json::from_value(json!({
            "error": {"type": "https://example.com/errors/custom", "status": 500}
        }))
        .unwrap();
        assert!(matches!(inline.error, RaiseError::Inline(_)));
    }
}
