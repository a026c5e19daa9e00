//! Node tree and position model

mod node;
mod position;

pub use node::{Node, NodeId, NodeKind, NodeTree, TreeBuildError, TreeCache};
pub use position::{Position, PositionParseError, PositionToken};
