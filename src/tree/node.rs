//! Nodes of the resolution tree and the states that produce them.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

/// A transition of the resolution state machine, as seen by the tree.
///
/// `key` identifies the logical state: two transitions with the same key land
/// on the same node. A transition that carries an answer is attached to its
/// parent instead of creating a node of its own.
pub trait ResolutionState {
    /// Identity of a logical state.
    type Key: Clone + Eq + Hash + Debug;
    /// Answer type carried by answer transitions.
    type Answer: Clone + Eq + Hash + Debug;

    /// Identity of this state.
    fn key(&self) -> Self::Key;

    /// Identity of the state that spawned this one, `None` for a root.
    fn parent_key(&self) -> Option<Self::Key>;

    /// The answer, when this transition is an answer transition.
    fn answer(&self) -> Option<&Self::Answer>;

    /// One-line description used in the rendered graph.
    fn label(&self) -> String;

    /// Time spent in this transition, when known.
    fn elapsed(&self) -> Option<Duration> {
        None
    }
}

/// One logical state in the tree.
#[derive(Debug, Clone)]
pub struct Node<K, A> {
    pub(crate) id: usize,
    pub(crate) key: K,
    pub(crate) label: String,
    pub(crate) children: Vec<usize>,
    pub(crate) answers: Vec<A>,
    pub(crate) visits: usize,
    pub(crate) time: Duration,
    child_set: HashSet<usize>,
    answer_set: HashSet<A>,
}

impl<K, A: Clone + Eq + Hash> Node<K, A> {
    pub(crate) fn new(id: usize, key: K, label: String) -> Self {
        Self {
            id,
            key,
            label,
            children: Vec::new(),
            answers: Vec::new(),
            visits: 0,
            time: Duration::ZERO,
            child_set: HashSet::new(),
            answer_set: HashSet::new(),
        }
    }

    /// Position of the node in creation order. The root is 0.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Identity of the state.
    #[must_use]
    pub const fn key(&self) -> &K {
        &self.key
    }

    /// Label of the first transition into this state.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Child node ids in first-seen order.
    #[must_use]
    pub fn children(&self) -> &[usize] {
        &self.children
    }

    /// Distinct answers found under this state, in arrival order.
    #[must_use]
    pub fn answers(&self) -> &[A] {
        &self.answers
    }

    /// How many transitions landed on this state.
    #[must_use]
    pub const fn visits(&self) -> usize {
        self.visits
    }

    /// Total time reported by transitions into this state.
    #[must_use]
    pub const fn time(&self) -> Duration {
        self.time
    }

    pub(crate) fn add_child(&mut self, child: usize) {
        if self.child_set.insert(child) {
            self.children.push(child);
        }
    }

    pub(crate) fn add_answer(&mut self, answer: A) {
        if self.answer_set.insert(answer.clone()) {
            self.answers.push(answer);
        }
    }
}

/// Several nodes read as one, e.g. all states of one rule.
#[derive(Debug)]
pub struct MultiNode<'a, K, A> {
    nodes: Vec<&'a Node<K, A>>,
}

impl<'a, K, A: Clone + Eq + Hash> MultiNode<'a, K, A> {
    pub(crate) fn new(nodes: Vec<&'a Node<K, A>>) -> Self {
        Self { nodes }
    }

    /// Underlying nodes.
    #[must_use]
    pub fn nodes(&self) -> &[&'a Node<K, A>] {
        &self.nodes
    }

    /// Sum of the nodes' time.
    #[must_use]
    pub fn time(&self) -> Duration {
        self.nodes.iter().map(|n| n.time).sum()
    }

    /// Union of the nodes' answers, first occurrence wins.
    #[must_use]
    pub fn answers(&self) -> Vec<A> {
        let mut seen = HashSet::new();
        self.nodes
            .iter()
            .flat_map(|n| n.answers.iter())
            .filter(|answer| seen.insert(*answer))
            .cloned()
            .collect()
    }
}
