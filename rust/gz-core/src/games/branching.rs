//! Single-role game with a fixed branching factor and depth.
//!
//! Every path leads to a distinct state: base `ply * branching + m` is set
//! when move `m` was played at `ply`. The goal rewards low move indices.

use crate::game::{BaseState, JointMove, StateMachine};

#[derive(Debug, Clone, Copy)]
pub struct Branching {
    pub branching: usize,
    pub depth: usize,
}

impl Branching {
    pub fn new(branching: usize, depth: usize) -> Self {
        assert!(branching >= 1 && depth >= 1, "branching and depth must be >= 1");
        Self { branching, depth }
    }

    /// Number of moves played so far.
    pub fn ply(state: &BaseState) -> usize {
        state.count_ones()
    }

    /// Move played at `ply`, if that ply has been reached.
    pub fn move_at(&self, state: &BaseState, ply: usize) -> Option<u32> {
        (0..self.branching)
            .find(|&m| state.get(ply * self.branching + m))
            .map(|m| m as u32)
    }
}

impl StateMachine for Branching {
    fn dupe(&self) -> Box<dyn StateMachine> {
        Box::new(*self)
    }

    fn role_count(&self) -> usize {
        1
    }

    fn base_count(&self) -> usize {
        self.branching * self.depth
    }

    fn move_count(&self, _role: usize) -> usize {
        self.branching
    }

    fn initial_state(&self) -> BaseState {
        BaseState::new(self.base_count())
    }

    fn legal_moves(&self, _state: &BaseState, _role: usize) -> Vec<u32> {
        (0..self.branching as u32).collect()
    }

    fn is_terminal(&self, state: &BaseState) -> bool {
        Self::ply(state) >= self.depth
    }

    fn goal_value(&self, state: &BaseState, _role: usize) -> i32 {
        if self.branching == 1 {
            return 100;
        }
        let worst = self.depth * (self.branching - 1);
        let spent: usize = (0..self.depth)
            .filter_map(|p| self.move_at(state, p))
            .map(|m| m as usize)
            .sum();
        (100 - (spent * 100) / worst) as i32
    }

    fn next_state(&self, state: &BaseState, joint: &JointMove) -> BaseState {
        let ply = Self::ply(state);
        let mut next = state.clone();
        next.set(ply * self.branching + joint.get(0) as usize, true);
        next
    }
}
