//! Per-kind task state machines
//!
//! Each task kind contributes three hooks to the advancement loop:
//! starting from a transformed input, resuming at a suspension point,
//! and (for composites) continuing after a child completes. Error
//! bubbling and the Try catch/retry algorithm live here too.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::dsl::{
    ErrorFilterFields, FlowDirective, ListenRead, ListenTo, RaiseError, RetryDefinition, RetryRef,
    TaskDefinition,
};
use crate::error::WorkflowError;
use crate::event;
use crate::expr;
use crate::message::WorkflowStatus;
use crate::retry;
use crate::services::CloudEvent;
use crate::tree::{NodeId, NodeKind, Position};

use super::executor::{Outcome, Step, WorkflowExecutor};
use super::instance::WorkflowInstance;

impl WorkflowExecutor {
    // =========================================================================
    // Start
    // =========================================================================

    pub(crate) async fn start_task(
        &self,
        inst: &mut WorkflowInstance,
        id: NodeId,
        input: Value,
        now: DateTime<Utc>,
    ) -> Result<Step, ExecError> {
        let node = self.tree.node(id);
        match node.kind {
            NodeKind::Root
            | NodeKind::Do
            | NodeKind::TryBlock
            | NodeKind::CatchBlock
            | NodeKind::ForBlock => Ok(self.start_sequence(inst, id, input)),
            NodeKind::For => self.begin_iteration(inst, id, 0, input),
            NodeKind::Try => Ok(self.start_try(inst, id, input)),
            NodeKind::Fork => Ok(self.start_fork(inst, id, input)),
            NodeKind::Switch => Ok(self.start_switch(inst, id, input)),
            NodeKind::Set => Ok(self.start_set(inst, id, input)),
            NodeKind::Raise => Ok(self.start_raise(inst, id, input)),
            NodeKind::Wait => Ok(self.start_wait(inst, id)),
            NodeKind::Call => self.start_call(inst, id, input).await,
            NodeKind::Listen => Ok(self.suspend_listen(inst, id)),
            NodeKind::Emit => self.start_emit(inst, id, input, now).await,
        }
    }

    fn start_sequence(&self, inst: &mut WorkflowInstance, id: NodeId, input: Value) -> Step {
        let node = self.tree.node(id);
        let Some(&first) = node.children.first() else {
            return Step::Finish {
                id,
                raw_output: input,
                directive: None,
                skipped: false,
            };
        };
        inst.state_mut(&node.position.clone()).child_index = Some(0);
        self.seed_child(inst, first, input);
        Step::Enter(first)
    }

    fn start_try(&self, inst: &mut WorkflowInstance, id: NodeId, input: Value) -> Step {
        let node = self.tree.node(id);
        // children[0] is always the try block; the catch block, if any, follows
        let block = node.children[0];
        self.seed_child(inst, block, input);
        Step::Enter(block)
    }

    fn start_fork(&self, inst: &mut WorkflowInstance, id: NodeId, input: Value) -> Step {
        let node = self.tree.node(id);
        let Some(&first) = node.children.first() else {
            return Step::Finish {
                id,
                raw_output: Value::Object(Map::new()),
                directive: None,
                skipped: false,
            };
        };
        inst.state_mut(&node.position.clone()).child_index = Some(0);
        self.seed_child(inst, first, input);
        Step::Enter(first)
    }

    fn start_switch(&self, inst: &mut WorkflowInstance, id: NodeId, input: Value) -> Step {
        let node = self.tree.node(id);
        let pos = node.position.clone();
        let Some(TaskDefinition::Switch(def)) = node.definition.as_ref() else {
            return Step::Raise(WorkflowError::runtime(&pos, "switch node without definition"));
        };
        let scope = self.scope_for(inst, id);
        for case_entry in &def.switch {
            for (case_name, case) in case_entry {
                let selected = match &case.when {
                    None => true,
                    Some(when) => match expr::evaluate_bool(when, &input, &scope, &pos) {
                        Ok(b) => b,
                        Err(err) => return Step::Raise(err),
                    },
                };
                if selected {
                    debug!(case = %case_name, "switch case matched");
                    let directive = case.then.clone().unwrap_or(FlowDirective::Continue);
                    return Step::Finish {
                        id,
                        raw_output: input,
                        directive: Some(directive),
                        skipped: false,
                    };
                }
            }
        }
        Step::Finish {
            id,
            raw_output: input,
            directive: Some(FlowDirective::Continue),
            skipped: false,
        }
    }

    fn start_set(&self, inst: &mut WorkflowInstance, id: NodeId, input: Value) -> Step {
        let node = self.tree.node(id);
        let pos = node.position.clone();
        let Some(TaskDefinition::Set(def)) = node.definition.as_ref() else {
            return Step::Raise(WorkflowError::runtime(&pos, "set node without definition"));
        };
        let scope = self.scope_for(inst, id);
        match expr::evaluate_value(&def.set, &input, &scope, &pos) {
            Ok(value) => Step::Finish {
                id,
                raw_output: value,
                directive: None,
                skipped: false,
            },
            Err(err) => Step::Raise(err),
        }
    }

    fn start_raise(&self, inst: &mut WorkflowInstance, id: NodeId, input: Value) -> Step {
        let node = self.tree.node(id);
        let pos = node.position.clone();
        let Some(TaskDefinition::Raise(def)) = node.definition.as_ref() else {
            return Step::Raise(WorkflowError::runtime(&pos, "raise node without definition"));
        };

        let declaration = match &def.raise.error {
            RaiseError::Inline(decl) => decl.clone(),
            RaiseError::Reference(name) => {
                match self.tree.document().error_declaration(name) {
                    Some(decl) => decl.clone(),
                    None => {
                        return Step::Raise(WorkflowError::configuration(
                            &pos,
                            format!("raise references unknown error {name:?}"),
                        ))
                    }
                }
            }
        };

        let scope = self.scope_for(inst, id);
        let mut fields = match serde_json::to_value(&declaration) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(overrides) = &def.raise.with {
            for (key, value) in overrides {
                match expr::evaluate_value(value, &input, &scope, &pos) {
                    Ok(v) => {
                        fields.insert(key.clone(), v);
                    }
                    Err(err) => return Step::Raise(err),
                }
            }
        }

        let error_type = match fields.get("type") {
            Some(Value::String(s)) => match expr::as_marked_expression(s) {
                Some(src) => match expr::evaluate(src, &input, &scope, &pos) {
                    Ok(Value::String(out)) => out,
                    Ok(other) => {
                        return Step::Raise(WorkflowError::configuration(
                            &pos,
                            format!("error type must be a string, got {other}"),
                        ))
                    }
                    Err(err) => return Step::Raise(err),
                },
                None => s.clone(),
            },
            _ => {
                return Step::Raise(WorkflowError::configuration(
                    &pos,
                    "raised error requires a string 'type'",
                ))
            }
        };
        let status = fields
            .get("status")
            .and_then(Value::as_u64)
            .map(|s| s as u16)
            .unwrap_or(500);
        let title = fields
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);
        let detail = fields
            .get("detail")
            .and_then(Value::as_str)
            .map(str::to_string);

        Step::Raise(WorkflowError {
            error_type,
            status,
            title,
            detail,
            instance: Some(pos.to_string()),
        })
    }

    fn start_wait(&self, inst: &mut WorkflowInstance, id: NodeId) -> Step {
        let node = self.tree.node(id);
        let pos = node.position.clone();
        let Some(TaskDefinition::Wait(def)) = node.definition.as_ref() else {
            return Step::Raise(WorkflowError::runtime(&pos, "wait node without definition"));
        };
        let delay = match def.wait.to_chrono() {
            Ok(d) => d,
            Err(e) => return Step::Raise(WorkflowError::configuration(&pos, e.to_string())),
        };
        if delay.num_milliseconds() <= self.config.min_delay_ms as i64 {
            let passthrough = inst
                .state(&pos)
                .and_then(|s| s.transformed_input.clone())
                .unwrap_or(Value::Null);
            return Step::Finish {
                id,
                raw_output: passthrough,
                directive: None,
                skipped: false,
            };
        }
        inst.active = pos;
        inst.status = WorkflowStatus::Waiting;
        Step::Done(Outcome::Scheduled { delay })
    }

    async fn start_call(
        &self,
        inst: &mut WorkflowInstance,
        id: NodeId,
        input: Value,
    ) -> Result<Step, ExecError> {
        let node = self.tree.node(id);
        let pos = node.position.clone();
        let Some(TaskDefinition::Call(def)) = node.definition.as_ref() else {
            return Ok(Step::Raise(WorkflowError::runtime(
                &pos,
                "call node without definition",
            )));
        };
        let scope = self.scope_for(inst, id);
        let mut with = Map::new();
        for (key, value) in &def.with {
            match expr::evaluate_value(value, &input, &scope, &pos) {
                Ok(v) => {
                    with.insert(key.clone(), v);
                }
                Err(err) => return Ok(Step::Raise(err)),
            }
        }
        if let Err(err) = self.resolve_authentication(&mut with, &pos) {
            return Ok(Step::Raise(err));
        }

        match self
            .caller
            .invoke(&def.call, &Value::Object(with), &input, &pos)
            .await
        {
            Ok(output) => Ok(Step::Finish {
                id,
                raw_output: output,
                directive: None,
                skipped: false,
            }),
            Err(err) => Ok(Step::Raise(err.at(&pos))),
        }
    }

    /// Replace a named `authentication` argument with the policy it
    /// references in `use.authentications`
    fn resolve_authentication(
        &self,
        with: &mut Map<String, Value>,
        at: &Position,
    ) -> Result<(), WorkflowError> {
        let name = match with.get("authentication") {
            Some(Value::String(name)) => name.clone(),
            _ => return Ok(()),
        };
        match self.tree.document().authentication(&name) {
            Some(policy) => {
                let value = serde_json::to_value(policy)
                    .map_err(|e| WorkflowError::runtime(at, e.to_string()))?;
                with.insert("authentication".to_string(), value);
                Ok(())
            }
            None => Err(WorkflowError::configuration(
                at,
                format!("unknown authentication policy {name:?}"),
            )),
        }
    }

    fn suspend_listen(&self, inst: &mut WorkflowInstance, id: NodeId) -> Step {
        let node = self.tree.node(id);
        let pos = node.position.clone();
        let Some(TaskDefinition::Listen(def)) = node.definition.as_ref() else {
            return Step::Raise(WorkflowError::runtime(&pos, "listen node without definition"));
        };
        let filters = match &def.listen.to {
            ListenTo::One(f) => vec![f.clone()],
            ListenTo::Any(fs) | ListenTo::All(fs) => fs.clone(),
        };
        inst.active = pos;
        inst.status = WorkflowStatus::Waiting;
        Step::Done(Outcome::Listening { filters })
    }

    async fn start_emit(
        &self,
        inst: &mut WorkflowInstance,
        id: NodeId,
        input: Value,
        now: DateTime<Utc>,
    ) -> Result<Step, ExecError> {
        let node = self.tree.node(id);
        let pos = node.position.clone();
        let Some(TaskDefinition::Emit(def)) = node.definition.as_ref() else {
            return Ok(Step::Raise(WorkflowError::runtime(
                &pos,
                "emit node without definition",
            )));
        };
        let scope = self.scope_for(inst, id);
        let mut attributes = Map::new();
        for (key, value) in &def.emit.event.with {
            match expr::evaluate_value(value, &input, &scope, &pos) {
                Ok(v) => {
                    attributes.insert(key.clone(), v);
                }
                Err(err) => return Ok(Step::Raise(err)),
            }
        }
        let event = match CloudEvent::from_attributes(attributes, now, &pos) {
            Ok(event) => event,
            Err(err) => return Ok(Step::Raise(err)),
        };
        if let Err(err) = self.sink.emit(&event, &pos).await {
            return Ok(Step::Raise(err.at(&pos)));
        }
        Ok(Step::Finish {
            id,
            raw_output: json!(event.id),
            directive: None,
            skipped: false,
        })
    }

    // =========================================================================
    // Resume
    // =========================================================================

    pub(crate) fn resume(
        &self,
        inst: &mut WorkflowInstance,
        id: NodeId,
    ) -> Result<Step, ExecError> {
        let node = self.tree.node(id);
        let pos = node.position.clone();
        match node.kind {
            NodeKind::Wait => {
                let passthrough = inst
                    .state(&pos)
                    .and_then(|s| s.transformed_input.clone())
                    .unwrap_or(Value::Null);
                Ok(Step::Finish {
                    id,
                    raw_output: passthrough,
                    directive: None,
                    skipped: false,
                })
            }
            NodeKind::Listen => Ok(self.resume_listen(inst, id)),
            other => Ok(Step::Raise(WorkflowError::runtime(
                &pos,
                format!("cannot resume a {other:?} node"),
            ))),
        }
    }

    fn resume_listen(&self, inst: &mut WorkflowInstance, id: NodeId) -> Step {
        let node = self.tree.node(id);
        let pos = node.position.clone();
        let Some(TaskDefinition::Listen(def)) = node.definition.as_ref() else {
            return Step::Raise(WorkflowError::runtime(&pos, "listen node without definition"));
        };
        let events = inst
            .state(&pos)
            .and_then(|s| s.events.clone())
            .unwrap_or_default();

        let matched: Result<Option<Vec<Value>>, WorkflowError> = match &def.listen.to {
            ListenTo::One(filter) => first_match(&events, filter, &pos).map(|m| m.map(|e| vec![e])),
            ListenTo::Any(filters) => {
                let mut found = None;
                for filter in filters {
                    if let Some(event) = match first_match(&events, filter, &pos) {
                        Ok(m) => m,
                        Err(e) => return Step::Raise(e),
                    } {
                        found = Some(vec![event]);
                        break;
                    }
                }
                Ok(found)
            }
            ListenTo::All(filters) => {
                let mut collected = Vec::with_capacity(filters.len());
                let mut complete = true;
                for filter in filters {
                    match first_match(&events, filter, &pos) {
                        Ok(Some(event)) => collected.push(event),
                        Ok(None) => {
                            complete = false;
                            break;
                        }
                        Err(e) => return Step::Raise(e),
                    }
                }
                Ok(complete.then_some(collected))
            }
        };

        match matched {
            Err(err) => Step::Raise(err),
            Ok(Some(events)) => {
                let projected: Vec<Value> = match def.listen.read {
                    ListenRead::Envelope => events,
                    ListenRead::Data => events
                        .into_iter()
                        .map(|e| e.get("data").cloned().unwrap_or(Value::Null))
                        .collect(),
                };
                let raw_output = match &def.listen.to {
                    ListenTo::One(_) => projected.into_iter().next().unwrap_or(Value::Null),
                    _ => Value::Array(projected),
                };
                Step::Finish {
                    id,
                    raw_output,
                    directive: None,
                    skipped: false,
                }
            }
            Ok(None) => self.suspend_listen(inst, id),
        }
    }

    // =========================================================================
    // Composite continuation
    // =========================================================================

    pub(crate) fn continue_for(
        &self,
        inst: &mut WorkflowInstance,
        for_id: NodeId,
        iteration_output: Value,
    ) -> Result<Step, ExecError> {
        let pos = self.tree.node(for_id).position.clone();
        let cursor = inst
            .state(&pos)
            .and_then(|s| s.iteration_cursor)
            .map(|c| c + 1)
            .unwrap_or(0);
        self.begin_iteration(inst, for_id, cursor, iteration_output)
    }

    pub(crate) fn begin_iteration(
        &self,
        inst: &mut WorkflowInstance,
        for_id: NodeId,
        cursor: usize,
        accumulator: Value,
    ) -> Result<Step, ExecError> {
        let node = self.tree.node(for_id);
        let pos = node.position.clone();
        let Some(TaskDefinition::For(def)) = node.definition.as_ref() else {
            return Ok(Step::Raise(WorkflowError::runtime(
                &pos,
                "for node without definition",
            )));
        };

        // the item list derives from the durable transformed input, so
        // resumption mid-loop recomputes the same list
        let base = inst
            .state(&pos)
            .and_then(|s| s.transformed_input.clone())
            .unwrap_or(Value::Null);
        let scope = self.scope_for(inst, for_id);
        let items = match expr::evaluate_list(&def.for_.in_, &base, &scope, &pos) {
            Ok(items) => items,
            Err(err) => return Ok(Step::Raise(err)),
        };

        if cursor >= items.len() {
            return Ok(Step::Finish {
                id: for_id,
                raw_output: accumulator,
                directive: None,
                skipped: false,
            });
        }

        {
            let state = inst.state_mut(&pos);
            state.iteration_cursor = Some(cursor);
            state
                .variables
                .insert(def.for_.item_var().to_string(), items[cursor].clone());
            state
                .variables
                .insert(def.for_.index_var().to_string(), json!(cursor));
        }

        if let Some(while_) = &def.while_ {
            let scope = self.scope_for(inst, for_id);
            match expr::evaluate_bool(while_, &accumulator, &scope, &pos) {
                Ok(true) => {}
                Ok(false) => {
                    return Ok(Step::Finish {
                        id: for_id,
                        raw_output: accumulator,
                        directive: None,
                        skipped: false,
                    })
                }
                Err(err) => return Ok(Step::Raise(err)),
            }
        }

        let block = node.children[0];
        self.seed_child(inst, block, accumulator);
        Ok(Step::Enter(block))
    }

    pub(crate) fn continue_fork(
        &self,
        inst: &mut WorkflowInstance,
        fork_id: NodeId,
        branch_id: NodeId,
        branch_output: Value,
    ) -> Result<Step, ExecError> {
        let node = self.tree.node(fork_id);
        let pos = node.position.clone();
        let Some(TaskDefinition::Fork(def)) = node.definition.as_ref() else {
            return Ok(Step::Raise(WorkflowError::runtime(
                &pos,
                "fork node without definition",
            )));
        };

        if def.fork.compete {
            return Ok(Step::Finish {
                id: fork_id,
                raw_output: branch_output,
                directive: None,
                skipped: false,
            });
        }

        let index = node
            .children
            .iter()
            .position(|c| *c == branch_id)
            .unwrap_or(0);
        let next = index + 1;
        if next < node.children.len() {
            let input = inst
                .state(&pos)
                .and_then(|s| s.transformed_input.clone())
                .unwrap_or(Value::Null);
            inst.state_mut(&pos).child_index = Some(next);
            let next_id = node.children[next];
            self.seed_child(inst, next_id, input);
            return Ok(Step::Enter(next_id));
        }

        // join: all branches done, aggregate by branch name
        let mut aggregate = Map::new();
        for &child in &node.children {
            let child_node = self.tree.node(child);
            let output = inst
                .state(&child_node.position)
                .and_then(|s| s.transformed_output.clone())
                .unwrap_or(Value::Null);
            aggregate.insert(child_node.name.clone(), output);
        }
        Ok(Step::Finish {
            id: fork_id,
            raw_output: Value::Object(aggregate),
            directive: None,
            skipped: false,
        })
    }

    // =========================================================================
    // Error bubbling and the Try catch algorithm
    // =========================================================================

    pub(crate) fn bubble(
        &self,
        inst: &mut WorkflowInstance,
        error: WorkflowError,
        now: DateTime<Utc>,
    ) -> Result<Step, ExecError> {
        let mut current = error;
        let origin = current
            .instance
            .as_deref()
            .and_then(|s| Position::parse(s).ok())
            .unwrap_or_else(|| inst.active.clone());

        let mut cursor = self.tree.node_at(&origin).and_then(|n| n.parent);
        while let Some(id) = cursor {
            let node = self.tree.node(id);
            cursor = node.parent;
            if node.kind != NodeKind::Try {
                continue;
            }
            // a try only guards errors raised inside its try block
            let block_pos = node.position.push_marker("try");
            if !block_pos.is_prefix_of(&origin) {
                continue;
            }
            match self.try_catch(inst, id, current.clone(), now)? {
                CatchOutcome::Handled(step) => return Ok(step),
                CatchOutcome::NotCaught => continue,
                CatchOutcome::Replaced(new_error) => {
                    current = new_error;
                    continue;
                }
            }
        }

        debug!(error = %current, "error not caught, faulting workflow");
        Ok(Step::Done(Outcome::Faulted(current)))
    }

    fn try_catch(
        &self,
        inst: &mut WorkflowInstance,
        try_id: NodeId,
        error: WorkflowError,
        now: DateTime<Utc>,
    ) -> Result<CatchOutcome, ExecError> {
        let node = self.tree.node(try_id);
        let pos = node.position.clone();
        let Some(TaskDefinition::Try(def)) = node.definition.as_ref() else {
            return Ok(CatchOutcome::NotCaught);
        };
        let catch = &def.catch;

        if let Some(filter) = catch.errors.as_ref().and_then(|e| e.with.as_ref()) {
            if !error_matches(filter, &error) {
                return Ok(CatchOutcome::NotCaught);
            }
        }

        let try_input = inst
            .state(&pos)
            .and_then(|s| s.transformed_input.clone())
            .unwrap_or(Value::Null);
        let error_scope = {
            let mut scope = self.scope_for(inst, try_id);
            scope.bind(catch.error_var(), error.to_value());
            scope
        };

        if let Some(when) = &catch.when {
            match expr::evaluate_bool(when, &try_input, &error_scope, &pos) {
                Ok(true) => {}
                Ok(false) => return Ok(CatchOutcome::NotCaught),
                Err(e) => return Ok(CatchOutcome::Replaced(e)),
            }
        }
        if let Some(except) = &catch.except_when {
            match expr::evaluate_bool(except, &try_input, &error_scope, &pos) {
                Ok(false) => {}
                Ok(true) => return Ok(CatchOutcome::NotCaught),
                Err(e) => return Ok(CatchOutcome::Replaced(e)),
            }
        }

        debug!(position = %pos, error = %error, "error caught by try");
        let retry_policy = match self.resolve_retry(&catch.retry, &pos) {
            Ok(policy) => policy,
            Err(e) => return Ok(CatchOutcome::Replaced(e)),
        };

        if let Some(policy) = retry_policy {
            let retry_wanted = match self.retry_conditions_pass(
                &policy,
                &try_input,
                &error_scope,
                &pos,
            ) {
                Ok(b) => b,
                Err(e) => return Ok(CatchOutcome::Replaced(e)),
            };
            if retry_wanted {
                let attempt = inst
                    .state(&pos)
                    .and_then(|s| s.attempt_index)
                    .unwrap_or(0);
                let first_attempt_at = inst.state(&pos).and_then(|s| s.started_at);
                let remaining = match retry::attempts_remaining(
                    &policy,
                    attempt,
                    first_attempt_at,
                    now,
                    &pos,
                ) {
                    Ok(b) => b,
                    Err(e) => return Ok(CatchOutcome::Replaced(e)),
                };
                if remaining {
                    let workflow_id = inst.workflow_id().unwrap_or_default();
                    let seed = retry::jitter_seed(workflow_id, &pos, attempt);
                    let delay = match retry::delay_for_attempt(
                        &policy,
                        attempt,
                        seed,
                        self.config.max_backoff_ms,
                        &pos,
                    ) {
                        Ok(d) => d,
                        Err(e) => return Ok(CatchOutcome::Replaced(e)),
                    };
                    {
                        let state = inst.state_mut(&pos);
                        state.attempt_index = Some(attempt + 1);
                        state.next_delay_ms = Some(delay.num_milliseconds().max(0) as u64);
                        state.caught_error = Some(error);
                    }
                    let block = node.children[0];
                    self.seed_child(inst, block, try_input);
                    inst.active = self.tree.node(block).position.clone();
                    inst.status = WorkflowStatus::Waiting;
                    debug!(attempt = attempt + 1, delay_ms = delay.num_milliseconds(), "retry scheduled");
                    return Ok(CatchOutcome::Handled(Step::Done(Outcome::Scheduled {
                        delay,
                    })));
                }
            }

            // retries exhausted or rejected: the catch body handles the
            // error, or it is rethrown as-is
            if let Some(step) = self.enter_catch_block(inst, try_id, &error, try_input) {
                return Ok(CatchOutcome::Handled(step));
            }
            return Ok(CatchOutcome::NotCaught);
        }

        // no retry policy: catch body, or swallow with the try's input
        // passing through
        if let Some(step) = self.enter_catch_block(inst, try_id, &error, try_input.clone()) {
            return Ok(CatchOutcome::Handled(step));
        }
        inst.state_mut(&pos).caught_error = Some(error);
        Ok(CatchOutcome::Handled(Step::Finish {
            id: try_id,
            raw_output: try_input,
            directive: None,
            skipped: false,
        }))
    }

    fn enter_catch_block(
        &self,
        inst: &mut WorkflowInstance,
        try_id: NodeId,
        error: &WorkflowError,
        try_input: Value,
    ) -> Option<Step> {
        let node = self.tree.node(try_id);
        let Some(TaskDefinition::Try(def)) = node.definition.as_ref() else {
            return None;
        };
        def.catch.do_.as_ref()?;
        let catch_block = node
            .children
            .iter()
            .copied()
            .find(|&c| self.tree.node(c).kind == NodeKind::CatchBlock)?;

        inst.state_mut(&node.position.clone()).caught_error = Some(error.clone());
        self.seed_child(inst, catch_block, try_input);
        let block_pos = self.tree.node(catch_block).position.clone();
        inst.state_mut(&block_pos)
            .variables
            .insert(def.catch.error_var().to_string(), error.to_value());
        Some(Step::Enter(catch_block))
    }

    fn resolve_retry(
        &self,
        retry: &Option<RetryRef>,
        at: &Position,
    ) -> Result<Option<RetryDefinition>, WorkflowError> {
        match retry {
            None => Ok(None),
            Some(RetryRef::Inline(def)) => Ok(Some(def.clone())),
            Some(RetryRef::Reference(name)) => self
                .tree
                .document()
                .retry_definition(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| {
                    WorkflowError::configuration(
                        at,
                        format!("catch references unknown retry policy {name:?}"),
                    )
                }),
        }
    }

    fn retry_conditions_pass(
        &self,
        policy: &RetryDefinition,
        input: &Value,
        error_scope: &crate::scope::Scope,
        at: &Position,
    ) -> Result<bool, WorkflowError> {
        if let Some(when) = &policy.when {
            if !expr::evaluate_bool(when, input, error_scope, at)? {
                return Ok(false);
            }
        }
        if let Some(except) = &policy.except_when {
            if expr::evaluate_bool(except, input, error_scope, at)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Alias kept local so the hook signatures line up with the loop
pub(crate) type ExecError = super::executor::ExecutorError;

enum CatchOutcome {
    /// The try took over; the step continues the advancement
    Handled(Step),

    /// Filters did not match; keep bubbling
    NotCaught,

    /// Evaluating the catch itself failed; bubble the new error instead
    Replaced(WorkflowError),
}

fn error_matches(filter: &ErrorFilterFields, error: &WorkflowError) -> bool {
    if let Some(t) = &filter.error_type {
        if *t != error.error_type {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if status != error.status {
            return false;
        }
    }
    if let Some(title) = &filter.title {
        if Some(title.as_str()) != error.title.as_deref() {
            return false;
        }
    }
    if let Some(detail) = &filter.detail {
        if Some(detail.as_str()) != error.detail.as_deref() {
            return false;
        }
    }
    if let Some(instance) = &filter.instance {
        if Some(instance.as_str()) != error.instance.as_deref() {
            return false;
        }
    }
    true
}

fn first_match(
    events: &[Value],
    filter: &crate::dsl::EventFilter,
    at: &Position,
) -> Result<Option<Value>, WorkflowError> {
    for candidate in events {
        if event::matches(filter, candidate, at)? {
            return Ok(Some(candidate.clone()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_filter_matching() {
        let pos = Position::parse("/do/0/x").unwrap();
        let error = WorkflowError::communication(&pos, 500, "boom");

        let mut filter = ErrorFilterFields::default();
        assert!(error_matches(&filter, &error));

        filter.status = Some(500);
        assert!(error_matches(&filter, &error));

        filter.status = Some(404);
        assert!(!error_matches(&filter, &error));

        let typed = ErrorFilterFields {
            error_type: Some(error.error_type.clone()),
            ..Default::default()
        };
        assert!(error_matches(&typed, &error));

        let wrong_type = ErrorFilterFields {
            error_type: Some("https://example.com/other".to_string()),
            ..Default::default()
        };
        assert!(!error_matches(&wrong_type, &error));
    }
}
