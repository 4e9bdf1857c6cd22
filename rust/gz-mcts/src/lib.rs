//! Batched PUCT search over any [`gz_core::StateMachine`].
//!
//! - Arena-backed node store with refcounted pruning and optional
//!   transpositions (`tree`)
//! - Evaluator that never blocks: playouts park on leaf requests and are
//!   backed up when predictions arrive (`evaluator`)
//! - Resumable search tasks driven by a batching backend (`search`)

pub mod arena;
pub mod choose;
pub mod evaluator;
pub mod infer;
pub mod node;
pub mod search;
pub mod state_key;
pub mod transposition;
pub mod tree;

pub use arena::{Arena, NodeId};
pub use choose::{choose_temperature, choose_top_visits, temperature_for_depth, visit_policy};
pub use evaluator::{Launch, MoveChoice, PuctEvaluator, SearchError, SearchStats};
pub use infer::{
    BackendError, FnInference, Inference, InlineBackend, LeafBackend, Prediction, Ticket,
    UniformInference,
};
pub use node::{EvalStatus, PuctEdge, PuctNode};
pub use search::{drive_inline, Continuation, Job, Progress, SearchTask};
pub use tree::{EdgeDebug, NodeDebug, NodeStore, TreeError, TreeStats};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_nonempty() {
        assert!(!VERSION.is_empty());
    }
}

#[cfg(test)]
mod mcts_tests;
