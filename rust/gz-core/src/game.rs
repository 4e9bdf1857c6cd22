//! State machine interface and the value types that cross it.
//!
//! States are sets of true base propositions (a bit vector), moves are indices
//! into a per-role move table, and a joint move holds one index per role.

use std::fmt;

/// Snapshot of a game state as a fixed-length bit vector of base propositions.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BaseState {
    words: Vec<u64>,
    len: usize,
}

impl BaseState {
    /// All-false state with `len` bases.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len, "base index out of range");
        (self.words[i / 64] >> (i % 64)) & 1 == 1
    }

    pub fn set(&mut self, i: usize, value: bool) {
        debug_assert!(i < self.len, "base index out of range");
        let bit = 1u64 << (i % 64);
        if value {
            self.words[i / 64] |= bit;
        } else {
            self.words[i / 64] &= !bit;
        }
    }

    /// Raw little-endian words; bits past `len` are always zero.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Indices of the true bases, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl fmt::Debug for BaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BaseState[")?;
        for (n, i) in self.ones().enumerate() {
            if n > 0 {
                write!(f, ",")?;
            }
            write!(f, "{i}")?;
        }
        write!(f, "]")
    }
}

/// One move index per role.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JointMove(Vec<u32>);

impl JointMove {
    pub fn new(role_count: usize) -> Self {
        Self(vec![0; role_count])
    }

    pub fn from_moves(moves: Vec<u32>) -> Self {
        Self(moves)
    }

    pub fn get(&self, role: usize) -> u32 {
        self.0[role]
    }

    pub fn set(&mut self, role: usize, index: u32) {
        self.0[role] = index;
    }

    pub fn role_count(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }
}

/// Game rules, consumed by search.
///
/// Implementations must be deterministic: the same state and joint move always
/// yield the same successor.
pub trait StateMachine: Send {
    /// Independent copy for another evaluator.
    fn dupe(&self) -> Box<dyn StateMachine>;

    fn role_count(&self) -> usize;

    /// Number of base propositions in every state.
    fn base_count(&self) -> usize;

    /// Size of `role`'s move table; legal move indices are below this.
    fn move_count(&self, role: usize) -> usize;

    fn initial_state(&self) -> BaseState;

    /// Legal move indices for `role`, ascending. Never empty for a non-terminal state.
    fn legal_moves(&self, state: &BaseState, role: usize) -> Vec<u32>;

    fn is_terminal(&self, state: &BaseState) -> bool;

    /// Goal value in `0..=100`.
    fn goal_value(&self, state: &BaseState, role: usize) -> i32;

    fn next_state(&self, state: &BaseState, joint: &JointMove) -> BaseState;

    fn move_name(&self, role: usize, index: u32) -> String {
        format!("r{role}:{index}")
    }
}

/// Goal values of every role scaled to `[0, 1]`.
pub fn final_scores(sm: &dyn StateMachine, state: &BaseState) -> Vec<f32> {
    (0..sm.role_count())
        .map(|r| (sm.goal_value(state, r).clamp(0, 100) as f32) / 100.0)
        .collect()
}
