//! Expression scopes
//!
//! A scope is the set of `$`-variables visible to one expression
//! evaluation. It is assembled bottom-up: the variables of the node chain
//! (loop item/index, caught error aliases), a descriptor of the current
//! task, and the root-level bindings (`$workflow`, `$context`,
//! `$runtime`, `$secrets`). Scopes are immutable snapshots composed per
//! evaluation; child bindings shadow parent bindings of the same name.

use std::collections::BTreeMap;

use serde_json::{json, Value};

/// Engine descriptor exposed to expressions as `$runtime`
#[derive(Debug, Clone)]
pub struct RuntimeDescriptor {
    pub name: String,
    pub version: String,
    pub metadata: Value,
}

impl Default for RuntimeDescriptor {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            metadata: json!({}),
        }
    }
}

impl RuntimeDescriptor {
    fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "version": self.version,
            "metadata": self.metadata,
        })
    }
}

/// An immutable variable snapshot for one evaluation
///
/// Bindings are kept sorted so every evaluation sees variables in a
/// stable order, which keeps advancements deterministic.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bindings: BTreeMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root scope: workflow descriptor, context, runtime, secrets
    pub fn root(workflow: Value, context: Value, runtime: &RuntimeDescriptor, secrets: Value) -> Self {
        let mut scope = Self::new();
        scope.bind("workflow", workflow);
        scope.bind("context", context);
        scope.bind("runtime", runtime.to_value());
        scope.bind("secrets", secrets);
        scope
    }

    /// Add or shadow a binding; `name` is given without the `$` sigil
    pub fn bind(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_string(), value);
    }

    /// Derive a child scope with extra bindings shadowing this one
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// Look up a binding
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// (name, value) pairs in stable order
    pub fn bindings(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.bindings.iter()
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Descriptor of the task under evaluation, bound as `$task`
pub fn task_descriptor(
    name: &str,
    reference: &str,
    definition: Value,
    input: &Value,
    output: Option<&Value>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Value {
    json!({
        "name": name,
        "reference": reference,
        "definition": definition,
        "input": input,
        "output": output,
        "startedAt": started_at.map(|t| t.to_rfc3339()),
    })
}
