//! Advancement engine
//!
//! `WorkflowExecutor::advance` runs one advancement: as much synchronous
//! work as possible from the active position, stopping at the next
//! suspension point (wait, retry, listen) or at completion. In-line Call
//! execution is the only awaited I/O.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use crate::dsl::{
    EventFilter, ExportClause, FlowDirective, InputClause, OutputClause, TimeoutClause,
};
use crate::error::WorkflowError;
use crate::expr;
use crate::message::{Message, MessageCodecError, WorkflowStatus};
use crate::schema::{self, Gate};
use crate::scope::{task_descriptor, RuntimeDescriptor, Scope};
use crate::services::{Caller, EventSink, NoCaller, NoEventSink};
use crate::state::NodeState;
use crate::tree::{Node, NodeId, NodeKind, NodeTree, Position};

use super::instance::WorkflowInstance;

/// Executor tuning knobs
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Hard cap on steps per advancement, against runaway `then` loops
    pub max_steps: usize,

    /// Clamp applied to exponential retry backoff
    pub max_backoff_ms: u64,

    /// Delays at or below this are executed as immediate completions
    pub min_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            max_backoff_ms: crate::retry::DEFAULT_MAX_BACKOFF_MS,
            min_delay_ms: 1,
        }
    }
}

/// Host-level executor failures
///
/// Workflow-level errors never surface here; they fault the instance and
/// come back inside the terminal message.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Message failed to decode
    #[error("message codec error: {0}")]
    Codec(#[from] MessageCodecError),

    /// Active position does not exist in this workflow's tree
    #[error("unknown position {0} in workflow tree")]
    UnknownPosition(String),

    /// Message is already terminal
    #[error("workflow is already {0}, refusing to advance")]
    AlreadyTerminal(WorkflowStatus),

    /// Step limit exhausted (runaway directive loop)
    #[error("advancement exceeded {0} steps")]
    StepLimit(usize),
}

/// Result of one advancement
#[derive(Debug)]
pub enum AdvanceOutcome {
    /// Workflow completed; the message is terminal
    Completed { message: Message, output: Value },

    /// Workflow faulted; the message is terminal and embeds the error
    Faulted {
        message: Message,
        error: WorkflowError,
    },

    /// Parked on a timer (wait or retry); the message belongs in the
    /// outbox until `delay` has elapsed
    Scheduled {
        message: Message,
        delay: chrono::Duration,
    },

    /// Parked awaiting external events matching `filters`
    Listening {
        message: Message,
        filters: Vec<EventFilter>,
    },
}

impl AdvanceOutcome {
    /// The produced continuation or terminal message
    pub fn message(&self) -> &Message {
        match self {
            Self::Completed { message, .. }
            | Self::Faulted { message, .. }
            | Self::Scheduled { message, .. }
            | Self::Listening { message, .. } => message,
        }
    }

    /// Status carried by the produced message
    pub fn status(&self) -> WorkflowStatus {
        self.message().status
    }
}

/// Control-flow step of the advancement loop
pub(crate) enum Step {
    /// Apply the input contract and start the node
    Enter(NodeId),

    /// Re-enter a node parked at a suspension point
    Resume(NodeId),

    /// Node body finished; apply the output contract and route onward
    Finish {
        id: NodeId,
        raw_output: Value,
        directive: Option<FlowDirective>,
        skipped: bool,
    },

    /// An error was raised; bubble it toward the nearest catching Try
    Raise(WorkflowError),

    /// Advancement is over
    Done(Outcome),
}

/// Terminal state of the advancement loop
pub(crate) enum Outcome {
    Completed(Value),
    Faulted(WorkflowError),
    Scheduled { delay: chrono::Duration },
    Listening { filters: Vec<EventFilter> },
}

/// Read-only view of a node's effective common clauses
///
/// Tasks read them from their definition; the root synthesizes them from
/// the workflow-level `input`/`output`/`timeout`; blocks have none.
#[derive(Default)]
pub(crate) struct CommonView<'a> {
    pub if_: Option<&'a str>,
    pub input: Option<&'a InputClause>,
    pub output: Option<&'a OutputClause>,
    pub export: Option<&'a ExportClause>,
    pub timeout: Option<&'a TimeoutClause>,
    pub then: Option<&'a FlowDirective>,
}

/// The workflow executor
///
/// One executor serves one workflow tree; it is cheap to construct and
/// stateless across advancements, so hosts may build one per message or
/// share one per (name, version).
pub struct WorkflowExecutor {
    pub(crate) tree: Arc<NodeTree>,
    pub(crate) document_value: Value,
    pub(crate) runtime: RuntimeDescriptor,
    pub(crate) secrets: Map<String, Value>,
    pub(crate) caller: Arc<dyn Caller>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) config: ExecutorConfig,
    now_override: Option<DateTime<Utc>>,
}

impl WorkflowExecutor {
    /// Create an executor over a built tree
    pub fn new(tree: Arc<NodeTree>) -> Self {
        let document_value =
            serde_json::to_value(tree.document().as_ref()).unwrap_or(Value::Null);
        Self {
            tree,
            document_value,
            runtime: RuntimeDescriptor::default(),
            secrets: Map::new(),
            caller: Arc::new(NoCaller),
            sink: Arc::new(NoEventSink),
            config: ExecutorConfig::default(),
            now_override: None,
        }
    }

    /// Wire up the Call collaborator
    pub fn with_caller(mut self, caller: Arc<dyn Caller>) -> Self {
        self.caller = caller;
        self
    }

    /// Wire up the Emit collaborator
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Supply secret values, exposed to expressions as `$secrets`
    pub fn with_secrets(mut self, secrets: Map<String, Value>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Override the runtime descriptor exposed as `$runtime`
    pub fn with_runtime(mut self, runtime: RuntimeDescriptor) -> Self {
        self.runtime = runtime;
        self
    }

    /// Override the tuning knobs
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Pin the advancement clock; every step of one advancement observes
    /// a single instant either way
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now_override = Some(now);
        self
    }

    /// Start a fresh instance from an input payload
    pub async fn start(&self, input: Value) -> Result<AdvanceOutcome, ExecutorError> {
        let doc = self.tree.document();
        let message = Message::start(doc.name(), doc.version(), input);
        self.advance(message).await
    }

    /// Run one advancement from a continuation message
    #[instrument(skip(self, message), fields(workflow = %message.name, position = %message.position))]
    pub async fn advance(&self, message: Message) -> Result<AdvanceOutcome, ExecutorError> {
        if message.status.is_terminal() {
            return Err(ExecutorError::AlreadyTerminal(message.status));
        }
        let mut inst = WorkflowInstance::from_message(&message)?;
        inst.status = WorkflowStatus::Running;
        let now = self.now_override.unwrap_or_else(Utc::now);

        let active = inst.active.clone();
        let node = self
            .tree
            .node_at(&active)
            .ok_or_else(|| ExecutorError::UnknownPosition(active.to_string()))?;
        let mut step = if inst.is_started(&active) {
            Step::Resume(node.id)
        } else {
            Step::Enter(node.id)
        };

        let mut steps = 0usize;
        let outcome = loop {
            steps += 1;
            if steps > self.config.max_steps {
                return Err(ExecutorError::StepLimit(self.config.max_steps));
            }
            step = match step {
                Step::Enter(id) => self.enter(&mut inst, id, now).await?,
                Step::Resume(id) => self.resume(&mut inst, id)?,
                Step::Finish {
                    id,
                    raw_output,
                    directive,
                    skipped,
                } => self.finish(&mut inst, id, raw_output, directive, skipped, now)?,
                Step::Raise(error) => self.bubble(&mut inst, error, now)?,
                Step::Done(outcome) => break outcome,
            };
        };

        Ok(match outcome {
            Outcome::Completed(output) => {
                inst.status = WorkflowStatus::Completed;
                inst.active = Position::root();
                let mut message = inst.to_message();
                message.output = Some(output.clone());
                debug!(status = %message.status, "workflow completed");
                AdvanceOutcome::Completed { message, output }
            }
            Outcome::Faulted(error) => {
                inst.status = WorkflowStatus::Faulted;
                if let Some(instance) = error.instance.as_deref() {
                    if let Ok(pos) = Position::parse(instance) {
                        if inst.state(&pos).is_some() {
                            inst.active = pos;
                        }
                    }
                }
                let mut message = inst.to_message();
                message.error = Some(error.clone());
                debug!(error = %error, "workflow faulted");
                AdvanceOutcome::Faulted { message, error }
            }
            Outcome::Scheduled { delay } => {
                inst.status = WorkflowStatus::Waiting;
                let message = inst.to_message();
                debug!(delay_ms = delay.num_milliseconds(), "workflow scheduled");
                AdvanceOutcome::Scheduled { message, delay }
            }
            Outcome::Listening { filters } => {
                inst.status = WorkflowStatus::Waiting;
                let message = inst.to_message();
                debug!(filters = filters.len(), "workflow listening");
                AdvanceOutcome::Listening { message, filters }
            }
        })
    }

    // =========================================================================
    // Node entry: the input side of the data-flow contract
    // =========================================================================

    async fn enter(
        &self,
        inst: &mut WorkflowInstance,
        id: NodeId,
        now: DateTime<Utc>,
    ) -> Result<Step, ExecutorError> {
        let node = self.tree.node(id);
        let pos = node.position.clone();
        inst.active = pos.clone();

        if node.kind == NodeKind::Root {
            let root = inst.root_state_mut();
            if root.context.is_none() {
                root.context = Some(Value::Object(Map::new()));
            }
        }

        match self.check_workflow_timeout(inst, &pos, now) {
            Ok(None) => {}
            Ok(Some(err)) => return Ok(Step::Raise(err)),
            Err(err) => return Ok(Step::Raise(err)),
        }

        let Some(raw_input) = inst.state(&pos).and_then(|s| s.raw_input.clone()) else {
            return Ok(Step::Raise(WorkflowError::runtime(
                &pos,
                "node entered without a raw input",
            )));
        };
        inst.state_mut(&pos).started_at = Some(now);

        let common = self.common_view(node);

        if let Some(input) = common.input {
            if let Some(schema) = &input.schema {
                if let Err(err) = schema::validate(schema, &raw_input, Gate::Input, &pos) {
                    return Ok(Step::Raise(err));
                }
            }
        }

        let scope = self.scope_for(inst, id);
        let transformed = match common.input.and_then(|i| i.from.as_ref()) {
            Some(from) => match self.eval_transform(from, &raw_input, &scope, &pos) {
                Ok(v) => v,
                Err(err) => return Ok(Step::Raise(err)),
            },
            None => raw_input.clone(),
        };
        inst.state_mut(&pos).transformed_input = Some(transformed.clone());

        if let Some(condition) = common.if_ {
            match expr::evaluate_bool(condition, &transformed, &scope, &pos) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(position = %pos, "task skipped by if condition");
                    return Ok(Step::Finish {
                        id,
                        raw_output: transformed,
                        directive: None,
                        skipped: true,
                    });
                }
                Err(err) => return Ok(Step::Raise(err)),
            }
        }

        self.start_task(inst, id, transformed, now).await
    }

    // =========================================================================
    // Node completion: the output side of the contract, then routing
    // =========================================================================

    fn finish(
        &self,
        inst: &mut WorkflowInstance,
        id: NodeId,
        raw_output: Value,
        directive: Option<FlowDirective>,
        skipped: bool,
        now: DateTime<Utc>,
    ) -> Result<Step, ExecutorError> {
        let node = self.tree.node(id);
        let pos = node.position.clone();

        let mut transformed = raw_output.clone();
        if !skipped {
            inst.state_mut(&pos).raw_output = Some(raw_output.clone());
            let common = self.common_view(node);
            let scope = self.scope_for(inst, id);

            if let Some(output) = common.output {
                if let Some(as_) = &output.as_ {
                    transformed = match self.eval_transform(as_, &raw_output, &scope, &pos) {
                        Ok(v) => v,
                        Err(err) => return Ok(Step::Raise(err)),
                    };
                }
                if let Some(schema) = &output.schema {
                    if let Err(err) = schema::validate(schema, &transformed, Gate::Output, &pos) {
                        return Ok(Step::Raise(err));
                    }
                }
            }

            if let Some(timeout) = common.timeout {
                match self.task_timed_out(inst, &pos, timeout, now) {
                    Ok(false) => {}
                    Ok(true) => {
                        return Ok(Step::Raise(WorkflowError::timeout(
                            &pos,
                            "task exceeded its timeout",
                        )))
                    }
                    Err(err) => return Ok(Step::Raise(err)),
                }
            }

            if let Some(export) = common.export {
                if let Some(as_) = &export.as_ {
                    let context = match self.eval_transform(as_, &transformed, &scope, &pos) {
                        Ok(v) => v,
                        Err(err) => return Ok(Step::Raise(err)),
                    };
                    if let Some(schema) = &export.schema {
                        // the prior context stays untouched on failure
                        if let Err(err) = schema::validate(schema, &context, Gate::Export, &pos) {
                            return Ok(Step::Raise(err));
                        }
                    }
                    if self.contains_secret(&context) {
                        return Ok(Step::Raise(WorkflowError::new(
                            crate::error::ErrorKind::Authorization,
                            &pos,
                            "secret values must not be exported into the context",
                        )));
                    }
                    inst.root_state_mut().context = Some(context);
                }
            }
        }
        inst.state_mut(&pos).transformed_output = Some(transformed.clone());

        if node.kind == NodeKind::Root {
            return Ok(Step::Done(Outcome::Completed(transformed)));
        }

        let Some(parent_id) = node.parent else {
            return Ok(Step::Raise(WorkflowError::runtime(
                &pos,
                "non-root node has no parent",
            )));
        };
        let parent = self.tree.node(parent_id);
        match parent.kind {
            NodeKind::Root
            | NodeKind::Do
            | NodeKind::TryBlock
            | NodeKind::CatchBlock
            | NodeKind::ForBlock => {
                let effective = directive
                    .or_else(|| self.common_view(node).then.cloned())
                    .unwrap_or(FlowDirective::Continue);
                self.route_sequential(inst, parent_id, id, transformed, effective)
            }
            NodeKind::For => self.continue_for(inst, parent_id, transformed),
            NodeKind::Try => {
                let try_pos = parent.position.clone();
                let state = inst.state_mut(&try_pos);
                state.attempt_index = None;
                state.next_delay_ms = None;
                Ok(Step::Finish {
                    id: parent_id,
                    raw_output: transformed,
                    directive: None,
                    skipped: false,
                })
            }
            NodeKind::Fork => self.continue_fork(inst, parent_id, id, transformed),
            other => Ok(Step::Raise(WorkflowError::runtime(
                &pos,
                format!("unexpected parent kind {other:?}"),
            ))),
        }
    }

    fn route_sequential(
        &self,
        inst: &mut WorkflowInstance,
        parent_id: NodeId,
        child_id: NodeId,
        value: Value,
        directive: FlowDirective,
    ) -> Result<Step, ExecutorError> {
        let parent = self.tree.node(parent_id);
        let child_pos = self.tree.node(child_id).position.clone();
        match directive {
            FlowDirective::Continue => {
                let index = parent
                    .children
                    .iter()
                    .position(|c| *c == child_id)
                    .unwrap_or(0);
                let next = index + 1;
                if next < parent.children.len() {
                    inst.state_mut(&parent.position.clone()).child_index = Some(next);
                    let next_id = parent.children[next];
                    self.seed_child(inst, next_id, value);
                    Ok(Step::Enter(next_id))
                } else {
                    Ok(Step::Finish {
                        id: parent_id,
                        raw_output: value,
                        directive: None,
                        skipped: false,
                    })
                }
            }
            FlowDirective::Exit => Ok(Step::Finish {
                id: parent_id,
                raw_output: value,
                directive: None,
                skipped: false,
            }),
            FlowDirective::End => Ok(Step::Finish {
                id: self.tree.root().id,
                raw_output: value,
                directive: None,
                skipped: false,
            }),
            FlowDirective::Next(name) => match parent.child_index_by_name(&name) {
                Some(index) => {
                    inst.state_mut(&parent.position.clone()).child_index = Some(index);
                    let target = parent.children[index];
                    self.seed_child(inst, target, value);
                    Ok(Step::Enter(target))
                }
                None => Ok(Step::Raise(WorkflowError::configuration(
                    &child_pos,
                    format!("'then' names no sibling {name:?}"),
                ))),
            },
        }
    }

    /// Reset a child subtree and hand it a fresh raw input
    pub(crate) fn seed_child(&self, inst: &mut WorkflowInstance, child_id: NodeId, input: Value) {
        let pos = self.tree.node(child_id).position.clone();
        inst.remove_descendants(&pos);
        *inst.state_mut(&pos) = NodeState::with_raw_input(input);
    }

    // =========================================================================
    // Scopes and transforms
    // =========================================================================

    pub(crate) fn scope_for(&self, inst: &WorkflowInstance, id: NodeId) -> Scope {
        let root_state = inst.root_state();
        let workflow = json!({
            "id": root_state.and_then(|s| s.workflow_id.map(|u| u.to_string())),
            "definition": self.document_value,
            "input": root_state.and_then(|s| s.raw_input.clone()),
            "startedAt": root_state.and_then(|s| s.started_at.map(|t| t.to_rfc3339())),
        });
        let mut scope = Scope::root(
            workflow,
            inst.context(),
            &self.runtime,
            Value::Object(self.secrets.clone()),
        );

        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            chain.push(node_id);
            cursor = self.tree.node(node_id).parent;
        }
        for node_id in chain.into_iter().rev() {
            let node = self.tree.node(node_id);
            if let Some(state) = inst.state(&node.position) {
                for (name, value) in &state.variables {
                    scope.bind(name, value.clone());
                }
            }
        }

        let node = self.tree.node(id);
        let state = inst.state(&node.position);
        let definition = node
            .definition
            .as_ref()
            .and_then(|d| serde_json::to_value(d).ok())
            .unwrap_or(Value::Null);
        let input = state
            .and_then(|s| s.transformed_input.clone().or_else(|| s.raw_input.clone()))
            .unwrap_or(Value::Null);
        let output = state.and_then(|s| s.raw_output.clone());
        scope.bind(
            "task",
            task_descriptor(
                &node.name,
                &node.position.to_string(),
                definition,
                &input,
                output.as_ref(),
                state.and_then(|s| s.started_at),
            ),
        );
        scope
    }

    pub(crate) fn eval_transform(
        &self,
        value: &Value,
        input: &Value,
        scope: &Scope,
        at: &Position,
    ) -> Result<Value, WorkflowError> {
        match value {
            Value::String(s) => expr::evaluate_field(s, input, scope, at),
            other => expr::evaluate_value(other, input, scope, at),
        }
    }

    pub(crate) fn common_view<'a>(&'a self, node: &'a Node) -> CommonView<'a> {
        match node.kind {
            NodeKind::Root => {
                let doc = self.tree.document();
                CommonView {
                    input: doc.input.as_ref(),
                    output: doc.output.as_ref(),
                    timeout: doc.timeout.as_ref(),
                    ..Default::default()
                }
            }
            NodeKind::TryBlock | NodeKind::CatchBlock | NodeKind::ForBlock => CommonView::default(),
            _ => {
                let common = node
                    .definition
                    .as_ref()
                    .map(|d| d.common())
                    .expect("task nodes carry a definition");
                CommonView {
                    if_: common.if_.as_deref(),
                    input: common.input.as_ref(),
                    output: common.output.as_ref(),
                    export: common.export.as_ref(),
                    timeout: common.timeout.as_ref(),
                    then: common.then.as_ref(),
                }
            }
        }
    }

    // =========================================================================
    // Timeouts and secrets
    // =========================================================================

    fn check_workflow_timeout(
        &self,
        inst: &WorkflowInstance,
        at: &Position,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowError>, WorkflowError> {
        let Some(timeout) = &self.tree.document().timeout else {
            return Ok(None);
        };
        let Some(started) = inst.root_state().and_then(|s| s.started_at) else {
            return Ok(None);
        };
        let after = timeout
            .after
            .to_chrono()
            .map_err(|e| WorkflowError::configuration(at, e.to_string()))?;
        if now - started >= after {
            return Ok(Some(WorkflowError::timeout(
                at,
                "workflow exceeded its timeout",
            )));
        }
        Ok(None)
    }

    fn task_timed_out(
        &self,
        inst: &WorkflowInstance,
        at: &Position,
        timeout: &TimeoutClause,
        now: DateTime<Utc>,
    ) -> Result<bool, WorkflowError> {
        let Some(started) = inst.state(at).and_then(|s| s.started_at) else {
            return Ok(false);
        };
        let after = timeout
            .after
            .to_chrono()
            .map_err(|e| WorkflowError::configuration(at, e.to_string()))?;
        Ok(now - started > after)
    }

    /// Deep scan for secret leaf values in a context candidate
    fn contains_secret(&self, value: &Value) -> bool {
        if self.secrets.is_empty() {
            return false;
        }
        let secrets = Value::Object(self.secrets.clone());
        let mut leaves = Vec::new();
        collect_leaves(&secrets, &mut leaves);
        let leaves: Vec<&Value> = leaves
            .into_iter()
            .filter(|v| match v {
                Value::Null | Value::Bool(_) => false,
                Value::String(s) => !s.is_empty(),
                _ => true,
            })
            .collect();
        if leaves.is_empty() {
            return false;
        }
        value_contains_any(value, &leaves)
    }
}

fn collect_leaves<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => map.values().for_each(|v| collect_leaves(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_leaves(v, out)),
        leaf => out.push(leaf),
    }
}

fn value_contains_any(value: &Value, needles: &[&Value]) -> bool {
    match value {
        Value::Object(map) => map.values().any(|v| value_contains_any(v, needles)),
        Value::Array(items) => items.iter().any(|v| value_contains_any(v, needles)),
        leaf => needles.iter().any(|n| *n == leaf),
    }
}
