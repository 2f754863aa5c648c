//! Resolution tree: a diagnostic record of which states a resolution visited
//! and which answers each produced.

pub mod node;
pub mod resolution_tree;

pub use node::{MultiNode, Node, ResolutionState};
pub use resolution_tree::ResolutionTree;
