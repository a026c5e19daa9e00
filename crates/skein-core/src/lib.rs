//! # Workflow Execution Kernel
//!
//! The execution kernel for Serverless Workflow DSL 1.0.0 documents.
//! A workflow is a tree of typed tasks; execution happens in short
//! synchronous bursts ("advancements") separated by durable checkpoints
//! serialized as continuation messages.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowExecutor                         │
//! │  (one advancement: active position -> next suspension point) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼────────────────┐
//!              ▼               ▼                ▼
//! ┌────────────────┐ ┌────────────────┐ ┌────────────────────┐
//! │    NodeTree     │ │  Scope + expr  │ │  Error & retry     │
//! │ (positions,     │ │  (jq over the  │ │  (taxonomy, catch  │
//! │  task arena)    │ │   scope chain) │ │   filters, backoff)│
//! └────────────────┘ └────────────────┘ └────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Message                               │
//! │     {n, v, s, p} continuation carried on the broker          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The kernel is database- and broker-agnostic: timed resumptions and
//! transports are the host's concern (see the runtime crate), wired in
//! through [`AdvanceOutcome`].

pub mod dsl;
pub mod error;
pub mod event;
pub mod exec;
pub mod expr;
pub mod message;
pub mod retry;
pub mod schema;
pub mod scope;
pub mod services;
pub mod state;
pub mod tree;

/// Prelude for common imports
pub mod prelude {
    pub use crate::dsl::{TaskDefinition, WorkflowDocument};
    pub use crate::error::{ErrorKind, WorkflowError};
    pub use crate::exec::{
        AdvanceOutcome, ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowInstance,
    };
    pub use crate::message::{Message, WorkflowStatus};
    pub use crate::scope::{RuntimeDescriptor, Scope};
    pub use crate::services::{Caller, CloudEvent, EventSink};
    pub use crate::state::NodeState;
    pub use crate::tree::{NodeTree, Position, TreeCache};
}

// Re-export key types at crate root
pub use dsl::WorkflowDocument;
pub use error::{ErrorKind, WorkflowError};
pub use exec::{AdvanceOutcome, ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowInstance};
pub use message::{Message, WorkflowStatus};
pub use scope::RuntimeDescriptor;
pub use services::{Caller, CloudEvent, EventSink};
pub use state::NodeState;
pub use tree::{NodeTree, Position, TreeCache};
