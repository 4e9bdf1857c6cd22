//! Exact keys for transposition lookup.

use gz_core::BaseState;

/// A state plus the depth it was reached at.
///
/// Only nodes at the same game depth are shared, so a key never matches an
/// ancestor and the node graph stays acyclic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    depth: u32,
    words: Box<[u64]>,
}

pub fn state_key(state: &BaseState, depth: u32) -> StateKey {
    StateKey {
        depth,
        words: state.words().into(),
    }
}
