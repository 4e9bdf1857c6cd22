//! Small deterministic games used by tests, benches and the CLI.

pub mod branching;
pub mod tictactoe;

pub use branching::Branching;
pub use tictactoe::TicTacToe;
