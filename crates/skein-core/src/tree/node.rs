//! Node tree
//!
//! The tree is built once per (name, version) from a parsed document and
//! shared immutably. Nodes live in an arena indexed by `NodeId`; parent
//! and child links are ids, so there are no reference cycles. Implicit
//! block nodes are inserted for the task lists owned by For and Try so
//! that every executable list has a composite parent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dsl::{TaskDefinition, TaskList, WorkflowDocument};

use super::position::Position;

/// Arena index of a node
pub type NodeId = usize;

/// Kind of a tree node
///
/// Task kinds mirror the DSL sum type; `Root` is the document itself and
/// the `*Block` kinds are the implicit composites wrapping nested task
/// lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    TryBlock,
    CatchBlock,
    ForBlock,
    Do,
    For,
    Switch,
    Fork,
    Try,
    Set,
    Raise,
    Wait,
    Call,
    Listen,
    Emit,
}

impl NodeKind {
    fn of(def: &TaskDefinition) -> Self {
        match def {
            TaskDefinition::Do(_) => Self::Do,
            TaskDefinition::For(_) => Self::For,
            TaskDefinition::Switch(_) => Self::Switch,
            TaskDefinition::Fork(_) => Self::Fork,
            TaskDefinition::Try(_) => Self::Try,
            TaskDefinition::Set(_) => Self::Set,
            TaskDefinition::Raise(_) => Self::Raise,
            TaskDefinition::Wait(_) => Self::Wait,
            TaskDefinition::Call(_) => Self::Call,
            TaskDefinition::Listen(_) => Self::Listen,
            TaskDefinition::Emit(_) => Self::Emit,
        }
    }

    /// Whether the kind owns a sequential child list
    pub fn is_sequential_composite(&self) -> bool {
        matches!(
            self,
            Self::Root | Self::Do | Self::TryBlock | Self::CatchBlock | Self::ForBlock
        )
    }
}

/// A single immutable tree node
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub position: Position,
    pub name: String,
    pub kind: NodeKind,

    /// Task definition; `None` for the root and the implicit blocks
    pub definition: Option<TaskDefinition>,

    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    child_names: HashMap<String, usize>,
}

impl Node {
    /// Child id at the given list index
    pub fn child_at(&self, index: usize) -> Option<NodeId> {
        self.children.get(index).copied()
    }

    /// Child list index for the given task name
    pub fn child_index_by_name(&self, name: &str) -> Option<usize> {
        self.child_names.get(name).copied()
    }
}

/// Tree build failures (all configuration errors)
#[derive(Debug, thiserror::Error)]
pub enum TreeBuildError {
    /// Two siblings share a name
    #[error("duplicate task name {name:?} at {position}")]
    DuplicateName { position: String, name: String },
}

/// The immutable node tree of one workflow (name, version)
#[derive(Debug)]
pub struct NodeTree {
    document: Arc<WorkflowDocument>,
    nodes: Vec<Node>,
    by_position: HashMap<Position, NodeId>,
}

impl NodeTree {
    /// Build the tree from a parsed document
    pub fn build(document: Arc<WorkflowDocument>) -> Result<Self, TreeBuildError> {
        let mut tree = Self {
            document: document.clone(),
            nodes: Vec::new(),
            by_position: HashMap::new(),
        };

        let root = tree.push_node(Position::root(), String::new(), NodeKind::Root, None, None);
        tree.add_list(root, &Position::root().push_marker("do"), &document.do_)?;
        Ok(tree)
    }

    /// The parsed document this tree was built from
    pub fn document(&self) -> &Arc<WorkflowDocument> {
        &self.document
    }

    /// The root node
    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    /// Node by arena id
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Node lookup by position, O(1) on the position index
    pub fn node_at(&self, position: &Position) -> Option<&Node> {
        self.by_position.get(position).map(|id| &self.nodes[*id])
    }

    /// Number of nodes in the tree
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push_node(
        &mut self,
        position: Position,
        name: String,
        kind: NodeKind,
        definition: Option<TaskDefinition>,
        parent: Option<NodeId>,
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            position: position.clone(),
            name,
            kind,
            definition,
            parent,
            children: Vec::new(),
            child_names: HashMap::new(),
        });
        self.by_position.insert(position, id);
        id
    }

    /// Add every task of `list` as a child of `parent`, at positions
    /// `{base}/{index}/{name}`
    fn add_list(
        &mut self,
        parent: NodeId,
        base: &Position,
        list: &TaskList,
    ) -> Result<(), TreeBuildError> {
        for (index, item) in list.iter().enumerate() {
            let position = base.push_index(index).push_name(&item.name);
            if self.nodes[parent]
                .child_names
                .contains_key(item.name.as_str())
            {
                return Err(TreeBuildError::DuplicateName {
                    position: position.to_string(),
                    name: item.name.clone(),
                });
            }
            let id = self.push_node(
                position.clone(),
                item.name.clone(),
                NodeKind::of(&item.task),
                Some(item.task.clone()),
                Some(parent),
            );
            let child_slot = self.nodes[parent].children.len();
            self.nodes[parent].children.push(id);
            self.nodes[parent]
                .child_names
                .insert(item.name.clone(), child_slot);
            self.add_task_children(id, &position, &item.task)?;
        }
        Ok(())
    }

    fn add_task_children(
        &mut self,
        id: NodeId,
        position: &Position,
        task: &TaskDefinition,
    ) -> Result<(), TreeBuildError> {
        match task {
            TaskDefinition::Do(t) => {
                self.add_list(id, &position.push_marker("do"), &t.do_)?;
            }
            TaskDefinition::For(t) => {
                let block_pos = position.push_marker("do");
                let block = self.push_block(block_pos.clone(), NodeKind::ForBlock, id);
                self.add_list(block, &block_pos, &t.do_)?;
            }
            TaskDefinition::Try(t) => {
                let try_pos = position.push_marker("try");
                let try_block = self.push_block(try_pos.clone(), NodeKind::TryBlock, id);
                self.add_list(try_block, &try_pos, &t.try_)?;
                if let Some(catch_do) = &t.catch.do_ {
                    let catch_pos = position.push_marker("catch").push_marker("do");
                    let catch_block = self.push_block(catch_pos.clone(), NodeKind::CatchBlock, id);
                    self.add_list(catch_block, &catch_pos, catch_do)?;
                }
            }
            TaskDefinition::Fork(t) => {
                let base = position.push_marker("fork").push_marker("branches");
                self.add_list(id, &base, &t.fork.branches)?;
            }
            TaskDefinition::Switch(_)
            | TaskDefinition::Set(_)
            | TaskDefinition::Raise(_)
            | TaskDefinition::Wait(_)
            | TaskDefinition::Call(_)
            | TaskDefinition::Listen(_)
            | TaskDefinition::Emit(_) => {}
        }
        Ok(())
    }

    fn push_block(&mut self, position: Position, kind: NodeKind, parent: NodeId) -> NodeId {
        let id = self.push_node(position, String::new(), kind, None, Some(parent));
        self.nodes[parent].children.push(id);
        id
    }
}

/// Cache of built trees keyed by (name, version)
///
/// Workflow definitions are immutable once cached and shared freely.
#[derive(Default)]
pub struct TreeCache {
    inner: RwLock<HashMap<(String, String), Arc<NodeTree>>>,
}

impl TreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached tree for (name, version), if present
    pub fn get(&self, name: &str, version: &str) -> Option<Arc<NodeTree>> {
        self.inner
            .read()
            .get(&(name.to_string(), version.to_string()))
            .cloned()
    }

    /// Build (or reuse) the tree for the given document
    pub fn get_or_build(
        &self,
        document: Arc<WorkflowDocument>,
    ) -> Result<Arc<NodeTree>, TreeBuildError> {
        let key = (
            document.name().to_string(),
            document.version().to_string(),
        );
        if let Some(tree) = self.inner.read().get(&key) {
            return Ok(tree.clone());
        }
        let tree = Arc::new(NodeTree::build(document)?);
        self.inner.write().insert(key, tree.clone());
        Ok(tree)
    }

    /// Drop a cached tree (used when a definition is deleted)
    pub fn invalidate(&self, name: &str, version: &str) {
        self.inner
            .write()
            .remove(&(name.to_string(), version.to_string()));
    }
}
