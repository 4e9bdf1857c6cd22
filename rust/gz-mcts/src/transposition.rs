//! Weak transposition table.
//!
//! Entries do not keep nodes alive. A lookup whose target has been freed
//! (slot empty or generation moved on) drops the entry and reports a miss.

use rustc_hash::FxHashMap;

use crate::arena::{Arena, NodeId};
use crate::state_key::StateKey;

#[derive(Default)]
pub struct TranspositionTable {
    map: FxHashMap<StateKey, NodeId>,
    hits: u64,
    stale_drops: u64,
}

impl TranspositionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn stale_drops(&self) -> u64 {
        self.stale_drops
    }

    pub fn lookup<T>(&mut self, key: &StateKey, arena: &Arena<T>) -> Option<NodeId> {
        let id = *self.map.get(key)?;
        if arena.contains(id) {
            self.hits += 1;
            return Some(id);
        }
        self.map.remove(key);
        self.stale_drops += 1;
        None
    }

    pub fn insert(&mut self, key: StateKey, id: NodeId) {
        self.map.insert(key, id);
    }

    /// Remove the entry for `key` if it still points at `id`.
    pub fn forget(&mut self, key: &StateKey, id: NodeId) {
        if self.map.get(key) == Some(&id) {
            self.map.remove(key);
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_key::state_key;
    use gz_core::BaseState;

    #[test]
    fn stale_entries_are_dropped_not_followed() {
        let mut arena = Arena::new();
        let mut tt = TranspositionTable::new();
        let s = BaseState::new(10);
        let k = state_key(&s, 3);
        let id = arena.insert(());
        tt.insert(k.clone(), id);
        assert_eq!(tt.lookup(&k, &arena), Some(id));

        arena.remove(id);
        let _reused = arena.insert(());
        assert_eq!(tt.lookup(&k, &arena), None);
        assert!(tt.is_empty());
        assert_eq!(tt.stale_drops(), 1);
    }

    #[test]
    fn depth_is_part_of_the_key() {
        let mut arena = Arena::new();
        let mut tt = TranspositionTable::new();
        let s = BaseState::new(4);
        let id = arena.insert(());
        tt.insert(state_key(&s, 1), id);
        assert_eq!(tt.lookup(&state_key(&s, 2), &arena), None);
        assert_eq!(tt.lookup(&state_key(&s, 1), &arena), Some(id));
    }

    #[test]
    fn forget_only_removes_matching_target() {
        let mut arena = Arena::new();
        let mut tt = TranspositionTable::new();
        let k = state_key(&BaseState::new(4), 0);
        let a = arena.insert(());
        let b = arena.insert(());
        tt.insert(k.clone(), b);
        tt.forget(&k, a);
        assert_eq!(tt.len(), 1);
        tt.forget(&k, b);
        assert!(tt.is_empty());
    }
}
