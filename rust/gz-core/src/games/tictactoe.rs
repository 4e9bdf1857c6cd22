//! Tic-tac-toe in the usual GGP shape: two roles, the role not in control
//! plays `noop`.
//!
//! Bases: `cell(i, x)` at `i`, `cell(i, o)` at `9 + i`, `control(x)` at 18,
//! `control(o)` at 19. Moves per role: `mark(i)` at `i`, `noop` at 9.

use crate::game::{BaseState, JointMove, StateMachine};

pub const CELLS: usize = 9;
pub const NOOP: u32 = 9;
const CONTROL_X: usize = 18;
const CONTROL_O: usize = 19;
const BASES: usize = 20;

const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

#[derive(Debug, Clone, Copy, Default)]
pub struct TicTacToe;

impl TicTacToe {
    fn mark_base(role: usize, cell: usize) -> usize {
        role * CELLS + cell
    }

    fn control_base(role: usize) -> usize {
        if role == 0 {
            CONTROL_X
        } else {
            CONTROL_O
        }
    }

    fn occupied(state: &BaseState, cell: usize) -> bool {
        state.get(Self::mark_base(0, cell)) || state.get(Self::mark_base(1, cell))
    }

    fn has_line(state: &BaseState, role: usize) -> bool {
        LINES
            .iter()
            .any(|line| line.iter().all(|&c| state.get(Self::mark_base(role, c))))
    }

    fn board_full(state: &BaseState) -> bool {
        (0..CELLS).all(|c| Self::occupied(state, c))
    }

    /// Role whose turn it is.
    pub fn to_play(state: &BaseState) -> usize {
        if state.get(CONTROL_X) {
            0
        } else {
            1
        }
    }
}

impl StateMachine for TicTacToe {
    fn dupe(&self) -> Box<dyn StateMachine> {
        Box::new(*self)
    }

    fn role_count(&self) -> usize {
        2
    }

    fn base_count(&self) -> usize {
        BASES
    }

    fn move_count(&self, _role: usize) -> usize {
        CELLS + 1
    }

    fn initial_state(&self) -> BaseState {
        let mut s = BaseState::new(BASES);
        s.set(CONTROL_X, true);
        s
    }

    fn legal_moves(&self, state: &BaseState, role: usize) -> Vec<u32> {
        if !state.get(Self::control_base(role)) {
            return vec![NOOP];
        }
        (0..CELLS)
            .filter(|&c| !Self::occupied(state, c))
            .map(|c| c as u32)
            .collect()
    }

    fn is_terminal(&self, state: &BaseState) -> bool {
        Self::has_line(state, 0) || Self::has_line(state, 1) || Self::board_full(state)
    }

    fn goal_value(&self, state: &BaseState, role: usize) -> i32 {
        let other = 1 - role;
        if Self::has_line(state, role) {
            100
        } else if Self::has_line(state, other) {
            0
        } else {
            50
        }
    }

    fn next_state(&self, state: &BaseState, joint: &JointMove) -> BaseState {
        let mover = Self::to_play(state);
        let mut next = state.clone();
        let cell = joint.get(mover);
        debug_assert!(cell < NOOP, "player in control must mark");
        next.set(Self::mark_base(mover, cell as usize), true);
        next.set(Self::control_base(mover), false);
        next.set(Self::control_base(1 - mover), true);
        next
    }

    fn move_name(&self, role: usize, index: u32) -> String {
        let r = if role == 0 { "x" } else { "o" };
        if index == NOOP {
            format!("{r}:noop")
        } else {
            format!("{r}:mark({},{})", index % 3, index / 3)
        }
    }
}
