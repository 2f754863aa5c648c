//! Global answer accounting.
//!
//! The ledger is owned by the monitor worker and never shared. It records how
//! many answers each stage created and consumed, the dataflow edges between
//! stages, and which sources have run dry. From that it decides when a root can
//! never receive another answer, even when the network contains cycles.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::reactive::identifier::ReactiveIdentifier;

/// Created/consumed answers attributed to one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnswerCount {
    /// Answers this stage put into the network.
    pub created: u64,
    /// Answers this stage took out of the network.
    pub consumed: u64,
}

impl AnswerCount {
    /// `created - consumed`.
    #[must_use]
    pub fn net(&self) -> i64 {
        i64::try_from(self.created).unwrap_or(i64::MAX) - i64::try_from(self.consumed).unwrap_or(i64::MAX)
    }
}

/// Read-only copy of the ledger.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    /// Per-stage answer counts.
    pub counts: HashMap<ReactiveIdentifier, AnswerCount>,
    /// Registered `(subscriber, publisher)` edges.
    pub paths: Vec<(ReactiveIdentifier, ReactiveIdentifier)>,
    /// Answers created for one `(publisher, subscriber)` edge only.
    pub edge_created: HashMap<(ReactiveIdentifier, ReactiveIdentifier), u64>,
    /// Sources that reported exhaustion.
    pub finished_sources: HashSet<ReactiveIdentifier>,
    /// Cause, if the resolution was terminated.
    pub terminated: Option<String>,
}

impl LedgerSnapshot {
    /// Counts recorded for `id` (zero if it never reported).
    #[must_use]
    pub fn count(&self, id: &ReactiveIdentifier) -> AnswerCount {
        self.counts.get(id).copied().unwrap_or_default()
    }

    /// Answers created on the edge from `publisher` to `subscriber`.
    #[must_use]
    pub fn edge_count(&self, publisher: &ReactiveIdentifier, subscriber: &ReactiveIdentifier) -> u64 {
        self.edge_created.get(&(*publisher, *subscriber)).copied().unwrap_or_default()
    }

    /// Total create events across the network, edge creates included.
    #[must_use]
    pub fn total_created(&self) -> u64 {
        self.counts.values().map(|c| c.created).sum::<u64>() + self.edge_created.values().sum::<u64>()
    }

    /// Total consume events across the network.
    #[must_use]
    pub fn total_consumed(&self) -> u64 {
        self.counts.values().map(|c| c.consumed).sum()
    }

    /// Answers created but not yet consumed, summed over the given stages and
    /// the edges into them.
    #[must_use]
    pub fn outstanding<'a>(&self, ids: impl IntoIterator<Item = &'a ReactiveIdentifier>) -> i64 {
        let ids: HashSet<&ReactiveIdentifier> = ids.into_iter().collect();
        let stages: i64 = ids.iter().map(|id| self.count(id).net()).sum();
        let edges: u64 = self
            .edge_created
            .iter()
            .filter(|((_, sub), _)| ids.contains(sub))
            .map(|(_, n)| *n)
            .sum();
        stages + i64::try_from(edges).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Default)]
pub(crate) struct AnswerLedger {
    counts: HashMap<ReactiveIdentifier, AnswerCount>,
    // (publisher, subscriber) -> answers meant for that subscriber alone
    edge_created: HashMap<(ReactiveIdentifier, ReactiveIdentifier), u64>,
    // subscriber -> publishers it pulls from
    upstream: HashMap<ReactiveIdentifier, HashSet<ReactiveIdentifier>>,
    // source -> finished
    sources: HashMap<ReactiveIdentifier, bool>,
}

impl AnswerLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create_answer(&mut self, id: ReactiveIdentifier) {
        self.counts.entry(id).or_default().created += 1;
    }

    pub(crate) fn create_answer_for(&mut self, publisher: ReactiveIdentifier, subscriber: ReactiveIdentifier) {
        *self.edge_created.entry((publisher, subscriber)).or_default() += 1;
    }

    pub(crate) fn consume_answer(&mut self, id: ReactiveIdentifier) {
        self.counts.entry(id).or_default().consumed += 1;
    }

    pub(crate) fn register_path(&mut self, subscriber: ReactiveIdentifier, publisher: ReactiveIdentifier) {
        self.upstream.entry(subscriber).or_default().insert(publisher);
    }

    pub(crate) fn register_source(&mut self, source: ReactiveIdentifier) {
        self.sources.entry(source).or_insert(false);
    }

    pub(crate) fn source_finished(&mut self, source: ReactiveIdentifier) {
        self.sources.insert(source, true);
    }

    /// Every stage `root` can reach by following publisher edges.
    pub(crate) fn reachable(&self, root: ReactiveIdentifier) -> HashSet<ReactiveIdentifier> {
        let mut visited = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(publishers) = self.upstream.get(&id) {
                stack.extend(publishers.iter().filter(|p| !visited.contains(*p)).copied());
            }
        }
        visited
    }

    /// Whether `root` will never receive another answer.
    ///
    /// Requires at least one reachable source, all reachable sources finished,
    /// and no answer in flight or held anywhere upstream of the root. Answers
    /// created for a single edge count only when that edge's subscriber is
    /// upstream of the root, so a sibling branch draining its own copies never
    /// holds this root open.
    pub(crate) fn is_exhausted(&self, root: ReactiveIdentifier) -> bool {
        let reachable = self.reachable(root);
        let mut sources = reachable.iter().filter_map(|id| self.sources.get(id)).peekable();
        if sources.peek().is_none() {
            return false;
        }
        if !sources.all(|finished| *finished) {
            return false;
        }
        let outstanding: i64 = reachable
            .iter()
            .filter_map(|id| self.counts.get(id))
            .map(AnswerCount::net)
            .sum::<i64>()
            + self
                .edge_created
                .iter()
                .filter(|((_, subscriber), _)| reachable.contains(subscriber))
                .map(|(_, n)| i64::try_from(*n).unwrap_or(i64::MAX))
                .sum::<i64>();
        debug_assert!(outstanding >= 0, "more answers consumed than created upstream of {root}");
        outstanding == 0
    }

    pub(crate) fn snapshot(&self, terminated: Option<String>) -> LedgerSnapshot {
        LedgerSnapshot {
            counts: self.counts.clone(),
            paths: self
                .upstream
                .iter()
                .flat_map(|(sub, pubs)| pubs.iter().map(move |p| (*sub, *p)))
                .collect(),
            edge_created: self.edge_created.clone(),
            finished_sources: self
                .sources
                .iter()
                .filter(|(_, finished)| **finished)
                .map(|(id, _)| *id)
                .collect(),
            terminated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::identifier::{BlockId, ElementKind};

    fn stage(block: BlockId, kind: ElementKind, n: u64) -> ReactiveIdentifier {
        ReactiveIdentifier::new(block, kind, n)
    }

    #[test]
    fn test_root_without_sources_is_never_exhausted() {
        let block = BlockId::new();
        let sink = stage(block, ElementKind::Sink, 0);
        let ledger = AnswerLedger::new();
        assert!(!ledger.is_exhausted(sink));
    }

    #[test]
    fn test_exhausted_once_sources_finish_and_answers_settle() {
        let block = BlockId::new();
        let source = stage(block, ElementKind::Source, 0);
        let map = stage(block, ElementKind::Map, 1);
        let sink = stage(block, ElementKind::Sink, 2);

        let mut ledger = AnswerLedger::new();
        ledger.register_source(source);
        ledger.register_path(map, source);
        ledger.register_path(sink, map);

        ledger.create_answer(source);
        assert!(!ledger.is_exhausted(sink));

        ledger.source_finished(source);
        assert!(!ledger.is_exhausted(sink), "one answer still in flight");

        ledger.consume_answer(sink);
        assert!(ledger.is_exhausted(sink));
    }

    #[test]
    fn test_reachability_terminates_on_cycles() {
        let block = BlockId::new();
        let source = stage(block, ElementKind::Source, 0);
        let merge = stage(block, ElementKind::Merge, 1);
        let buffer = stage(block, ElementKind::Buffer, 2);
        let flat = stage(block, ElementKind::FlatMap, 3);
        let sink = stage(block, ElementKind::Sink, 4);

        let mut ledger = AnswerLedger::new();
        ledger.register_source(source);
        ledger.register_path(merge, source);
        ledger.register_path(merge, flat);
        ledger.register_path(buffer, merge);
        ledger.register_path(flat, buffer);
        ledger.register_path(sink, buffer);

        let reachable = ledger.reachable(sink);
        assert_eq!(reachable.len(), 5);

        ledger.source_finished(source);
        assert!(ledger.is_exhausted(sink));
    }

    #[test]
    fn test_unrelated_sources_do_not_block_a_root() {
        let block = BlockId::new();
        let finished = stage(block, ElementKind::Source, 0);
        let other = stage(block, ElementKind::Source, 1);
        let sink = stage(block, ElementKind::Sink, 2);

        let mut ledger = AnswerLedger::new();
        ledger.register_source(finished);
        ledger.register_source(other);
        ledger.register_path(sink, finished);
        ledger.source_finished(finished);
        ledger.create_answer(other);

        assert!(ledger.is_exhausted(sink));
    }

    #[test]
    fn test_snapshot_reports_counts() {
        let block = BlockId::new();
        let source = stage(block, ElementKind::Source, 0);
        let mut ledger = AnswerLedger::new();
        ledger.register_source(source);
        ledger.create_answer(source);
        ledger.create_answer(source);
        ledger.source_finished(source);

        let snapshot = ledger.snapshot(None);
        assert_eq!(snapshot.count(&source), AnswerCount { created: 2, consumed: 0 });
        assert_eq!(snapshot.total_created(), 2);
        assert!(snapshot.finished_sources.contains(&source));
    }

    #[test]
    fn test_copies_for_a_sibling_branch_do_not_hold_a_root_open() {
        let block = BlockId::new();
        let source = stage(block, ElementKind::Source, 0);
        let buffer = stage(block, ElementKind::Buffer, 1);
        let left = stage(block, ElementKind::Sink, 2);
        let right = stage(block, ElementKind::Sink, 3);

        let mut ledger = AnswerLedger::new();
        ledger.register_source(source);
        ledger.register_path(buffer, source);
        ledger.register_path(left, buffer);
        ledger.register_path(right, buffer);

        ledger.create_answer(source);
        ledger.create_answer_for(buffer, left);
        ledger.create_answer_for(buffer, right);
        ledger.consume_answer(buffer);
        ledger.source_finished(source);

        ledger.consume_answer(left);
        assert!(ledger.is_exhausted(left), "right's copy is not left's concern");
        assert!(!ledger.is_exhausted(right), "right still holds a queued copy");

        ledger.consume_answer(right);
        assert!(ledger.is_exhausted(right));

        let snapshot = ledger.snapshot(None);
        assert_eq!(snapshot.edge_count(&buffer, &right), 1);
        assert_eq!(snapshot.total_created(), snapshot.total_consumed());
        assert_eq!(snapshot.outstanding([&source, &buffer, &left]), 0);
    }
}
