use crate::register::NUM_SLOTS;
use serde::{Deserialize, Serialize};

/// Control stack action.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::EnumIter,
    strum::Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    /// Reconvergence point of a divergent conditional.
    ConditionalPush,
    /// Exit of a loop; lanes that broke rejoin at the target.
    BreakPush,
    /// Return point of a call; lanes that returned rejoin at the target.
    ReturnPush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub action: Action,
    pub target: usize,
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.action, self.target)
    }
}

/// Divergence and reconvergence stack of both workgroup slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlStack {
    pub cluster_id: usize,
    depth: usize,
    stacks: [Vec<Entry>; NUM_SLOTS],
}

impl CtrlStack {
    #[must_use]
    pub fn new(cluster_id: usize, depth: usize) -> Self {
        Self {
            cluster_id,
            depth,
            stacks: [Vec::with_capacity(depth), Vec::with_capacity(depth)],
        }
    }

    /// Push an entry.
    ///
    /// # Panics
    /// If the stack of the slot overflows.
    pub fn push(&mut self, slot: usize, action: Action, target: usize) {
        let stack = &mut self.stacks[slot];
        assert!(
            stack.len() < self.depth,
            "cluster {}: control stack overflow in slot {} (depth={}) pushing {}@{}",
            self.cluster_id,
            slot,
            self.depth,
            action,
            target
        );
        stack.push(Entry { action, target });
        log::trace!(
            "cluster {}: slot {} control stack push {}@{} (depth {})",
            self.cluster_id,
            slot,
            action,
            target,
            stack.len()
        );
    }

    /// Pop the top entry.
    ///
    /// # Panics
    /// If the stack of the slot is empty.
    pub fn pop(&mut self, slot: usize) -> Entry {
        let Some(entry) = self.stacks[slot].pop() else {
            panic!(
                "cluster {}: control stack underflow in slot {}",
                self.cluster_id, slot
            );
        };
        log::trace!(
            "cluster {}: slot {} control stack pop {}",
            self.cluster_id,
            slot,
            entry
        );
        entry
    }

    #[must_use]
    pub fn top(&self, slot: usize) -> Option<&Entry> {
        self.stacks[slot].last()
    }

    #[must_use]
    pub fn len(&self, slot: usize) -> usize {
        self.stacks[slot].len()
    }

    #[must_use]
    pub fn is_empty(&self, slot: usize) -> bool {
        self.stacks[slot].is_empty()
    }

    /// Clear the stack of a slot when a new workgroup is loaded.
    pub fn reset(&mut self, slot: usize) {
        self.stacks[slot].clear();
    }
}
