//! DAG-compressed record of a resolution.
//!
//! Every distinct logical state becomes one node no matter how often the
//! execution revisits it. Recursive rules revisit states, so the node graph can
//! contain cycles; rendering walks it with an explicit stack and visited set.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::ReactiveResult;

use super::node::{MultiNode, Node, ResolutionState};

type TreeNode<S> = Node<<S as ResolutionState>::Key, <S as ResolutionState>::Answer>;

/// Nodes and edges of one resolution, rooted at the query state.
#[derive(Debug)]
pub struct ResolutionTree<S: ResolutionState> {
    root_key: S::Key,
    root_label: String,
    nodes: Vec<TreeNode<S>>,
    index: HashMap<S::Key, usize>,
}

impl<S: ResolutionState> ResolutionTree<S> {
    /// Tree holding only `root`.
    pub fn new(root: &S) -> Self {
        let mut tree = Self {
            root_key: root.key(),
            root_label: root.label(),
            nodes: Vec::new(),
            index: HashMap::new(),
        };
        tree.insert_root();
        tree
    }

    fn insert_root(&mut self) {
        let root = Node::new(0, self.root_key.clone(), self.root_label.clone());
        self.index.insert(self.root_key.clone(), 0);
        self.nodes.push(root);
    }

    /// Record a transition and return the id of the node it touched.
    ///
    /// Answer transitions attach their answer to the parent node. Any other
    /// transition is looked up by key (created on first sight) and linked
    /// under its parent. A parent seen for the first time here gets a node of
    /// its own, labelled by its key.
    pub fn update_tree(&mut self, state: &S) -> usize {
        let parent = state.parent_key().map(|key| {
            let label = format!("{key:?}");
            self.node_for(key, label)
        });

        if let Some(answer) = state.answer() {
            // an answer without a parent has nowhere else to go
            let target = parent.unwrap_or(0);
            self.nodes[target].add_answer(answer.clone());
            return target;
        }

        let id = self.node_for(state.key(), state.label());
        let node = &mut self.nodes[id];
        node.visits += 1;
        if let Some(elapsed) = state.elapsed() {
            node.time += elapsed;
        }
        if let Some(parent) = parent {
            self.nodes[parent].add_child(id);
        }
        id
    }

    fn node_for(&mut self, key: S::Key, label: String) -> usize {
        if let Some(id) = self.index.get(&key) {
            return *id;
        }
        let id = self.nodes.len();
        self.nodes.push(Node::new(id, key.clone(), label));
        self.index.insert(key, id);
        id
    }

    /// Node recorded for `state`'s key.
    #[must_use]
    pub fn get_node(&self, state: &S) -> Option<&TreeNode<S>> {
        self.node_by_key(&state.key())
    }

    /// Node recorded for `key`.
    #[must_use]
    pub fn node_by_key(&self, key: &S::Key) -> Option<&TreeNode<S>> {
        self.index.get(key).map(|id| &self.nodes[*id])
    }

    /// Every node in creation order.
    #[must_use]
    pub fn get_nodes(&self) -> &[TreeNode<S>] {
        &self.nodes
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> &TreeNode<S> {
        &self.nodes[0]
    }

    /// View several states as one node. Unknown keys are skipped.
    #[must_use]
    pub fn multi_node<'a>(&'a self, keys: impl IntoIterator<Item = &'a S::Key>) -> MultiNode<'a, S::Key, S::Answer> {
        MultiNode::new(keys.into_iter().filter_map(|k| self.node_by_key(k)).collect())
    }

    /// Forget everything but the root.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
        self.insert_root();
    }

    /// Graph description of every node reachable from the root.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("graph {\n");
        let mut visited = HashSet::new();
        let mut stack = vec![0_usize];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let node = &self.nodes[id];
            let _ = writeln!(out, "{}\t[label=\"{}\"];", node.id, escape(&node_label(node)));
            for child in &node.children {
                let _ = writeln!(out, "{} -- {};", node.id, child);
            }
            // reversed so children are visited in first-seen order
            stack.extend(node.children.iter().rev().filter(|c| !visited.contains(*c)));
        }
        out.push_str("}\n");
        out
    }

    /// Write [`Self::render`] to `path`.
    ///
    /// Failures are logged and returned; they never affect the resolution.
    pub fn output_to_file(&self, path: &Path) -> ReactiveResult<()> {
        if let Err(e) = fs::write(path, self.render()) {
            warn!(path = %path.display(), error = %e, "failed to write resolution tree");
            return Err(e.into());
        }
        debug!(path = %path.display(), nodes = self.nodes.len(), "resolution tree written");
        Ok(())
    }
}

fn node_label<K, A>(node: &Node<K, A>) -> String {
    if node.answers.is_empty() {
        node.label.clone()
    } else {
        format!("{} ({} answers)", node.label, node.answers.len())
    }
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', " ")
}
