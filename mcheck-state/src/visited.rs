//! Detection of states that were already explored.

use std::rc::Rc;

use crate::snapshot::{Snapshot, SnapshotContext};

/// An entry of a [VisitedStore].
pub trait VisitedEntry {
    /// The discriminator: `(task_count, heap_bytes_used)`. Entries with different keys are never
    /// the same state.
    fn key(&self) -> (usize, u64);

    fn num(&self) -> u64;

    /// The number of the entry this one replaced as representative of its state.
    fn other_num(&self) -> Option<u64>;

    fn set_other_num(&mut self, num: u64);

    /// Full comparison, only called for entries with equal keys.
    fn same_state(&self, other: &Self, ctx: &SnapshotContext) -> bool;

    /// Returns whether the entry must not be evicted.
    fn is_important(&self, ctx: &SnapshotContext) -> bool;
}

/// Sorted list of visited entries with bounded size.
pub struct VisitedStore<E> {
    entries: Vec<E>,
    max_entries: usize,

    /// The number of full comparisons performed so far.
    comparisons: u64,
}

impl<E: VisitedEntry> VisitedStore<E> {
    /// Create a store holding at most `max_entries`, 0 disables the store.
    pub fn new(max_entries: usize) -> Self {
        Self { entries: vec![], max_entries, comparisons: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    pub fn comparisons(&self) -> u64 {
        self.comparisons
    }

    /// Check whether `entry` was already visited.
    ///
    /// On a match the existing entry is replaced by `entry` and returned. Otherwise `entry` is
    /// inserted, evicting the oldest unimportant entry when the store is full.
    pub fn is_visited(&mut self, mut entry: E, ctx: &SnapshotContext) -> Option<E> {
        if self.max_entries == 0 {
            return None;
        }

        let key = entry.key();
        let start = self.entries.partition_point(|x| x.key() < key);
        let end = start + self.entries[start..].partition_point(|x| x.key() == key);
        if start == end {
            tracing::trace!("state {}: no candidate with key {key:?}", entry.num());
        }

        for i in start..end {
            self.comparisons += 1;
            if !self.entries[i].same_state(&entry, ctx) {
                continue;
            }

            let old = &self.entries[i];
            tracing::debug!(
                "State {} already visited ! (equal to state {})",
                entry.num(),
                old.num()
            );
            entry.set_other_num(old.other_num().unwrap_or(old.num()));
            return Some(std::mem::replace(&mut self.entries[i], entry));
        }

        tracing::trace!("state {}: new ({} candidates)", entry.num(), end - start);
        self.entries.insert(start, entry);
        self.evict(ctx);
        None
    }

    fn evict(&mut self, ctx: &SnapshotContext) {
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, x)| !x.is_important(ctx))
                .min_by_key(|(_, x)| x.num())
                .map(|(i, _)| i);
            let Some(i) = oldest else {
                tracing::warn!(
                    "Unable to evict a visited state: all {} entries are in use",
                    self.entries.len()
                );
                return;
            };
            let removed = self.entries.remove(i);
            tracing::debug!("Evicted state {} from visited states", removed.num());
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisitedState {
    pub snapshot: Rc<Snapshot>,
    pub num: u64,
    pub other_num: Option<u64>,
    pub task_count: usize,
    pub heap_bytes_used: u64,
}

impl VisitedState {
    pub fn new(snapshot: Rc<Snapshot>, num: u64) -> Self {
        let task_count = snapshot.task_count();
        let heap_bytes_used = snapshot.heap_bytes_used();
        Self { snapshot, num, other_num: None, task_count, heap_bytes_used }
    }
}

impl VisitedEntry for VisitedState {
    fn key(&self) -> (usize, u64) {
        (self.task_count, self.heap_bytes_used)
    }

    fn num(&self) -> u64 {
        self.num
    }

    fn other_num(&self) -> Option<u64> {
        self.other_num
    }

    fn set_other_num(&mut self, num: u64) {
        self.other_num = Some(num);
    }

    fn same_state(&self, other: &Self, ctx: &SnapshotContext) -> bool {
        ctx.snapshot_equal(&self.snapshot, &other.snapshot)
    }

    fn is_important(&self, ctx: &SnapshotContext) -> bool {
        ctx.is_parent(&self.snapshot)
    }
}

/// A state of the checked process combined with the state of a property automaton.
#[derive(Debug, Clone)]
pub struct VisitedPair {
    pub state: VisitedState,
    pub automaton_state: usize,

    /// The values of the atomic propositions in this state.
    pub atomic_propositions: Vec<i32>,
}

impl VisitedPair {
    pub fn new(
        snapshot: Rc<Snapshot>,
        num: u64,
        automaton_state: usize,
        atomic_propositions: Vec<i32>,
    ) -> Self {
        Self { state: VisitedState::new(snapshot, num), automaton_state, atomic_propositions }
    }
}

impl VisitedEntry for VisitedPair {
    fn key(&self) -> (usize, u64) {
        self.state.key()
    }

    fn num(&self) -> u64 {
        self.state.num
    }

    fn other_num(&self) -> Option<u64> {
        self.state.other_num
    }

    fn set_other_num(&mut self, num: u64) {
        self.state.other_num = Some(num);
    }

    fn same_state(&self, other: &Self, ctx: &SnapshotContext) -> bool {
        self.automaton_state == other.automaton_state
            && self.atomic_propositions == other.atomic_propositions
            && self.state.same_state(&other.state, ctx)
    }

    fn is_important(&self, ctx: &SnapshotContext) -> bool {
        self.state.is_important(ctx)
    }
}
