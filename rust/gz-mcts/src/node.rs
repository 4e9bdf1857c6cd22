//! Node and edge statistics for PUCT.

use gz_core::{BaseState, JointMove};

use crate::arena::NodeId;
use crate::infer::Ticket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalStatus {
    Unevaluated,
    /// Waiting on a prediction for this ticket.
    Pending(Ticket),
    Expanded,
}

/// One legal move of the lead role, with its statistics.
#[derive(Debug, Clone)]
pub struct PuctEdge {
    pub lead_move: u32,
    pub joint: JointMove,
    pub child: Option<NodeId>,
    pub prior: f32,
    /// Prior used for selection; differs from `prior` only at a noised root.
    pub noisy_prior: f32,
    pub visits: u32,
    pub value_sum: Vec<f32>,
    /// Playouts currently reserved through this edge (virtual visits of value 0).
    pub inflight: u32,
}

impl PuctEdge {
    pub fn new(lead_move: u32, joint: JointMove, role_count: usize) -> Self {
        Self {
            lead_move,
            joint,
            child: None,
            prior: 0.0,
            noisy_prior: 0.0,
            visits: 0,
            value_sum: vec![0.0; role_count],
            inflight: 0,
        }
    }

    /// Visits including virtual ones.
    pub fn effective_visits(&self) -> u32 {
        self.visits + self.inflight
    }

    /// Mean value for `role` over real visits, 0 when unvisited.
    pub fn mean(&self, role: usize) -> f32 {
        if self.visits == 0 {
            0.0
        } else {
            self.value_sum[role] / self.visits as f32
        }
    }

    /// Mean value for `role` counting in-flight playouts as value 0.
    pub fn mean_effective(&self, role: usize) -> f32 {
        let n = self.effective_visits();
        if n == 0 {
            0.0
        } else {
            self.value_sum[role] / n as f32
        }
    }
}

#[derive(Debug, Clone)]
pub struct PuctNode {
    pub state: BaseState,
    pub game_depth: u32,
    /// Role whose choice the edges enumerate.
    pub lead_role: usize,
    pub children: Vec<PuctEdge>,
    pub status: EvalStatus,
    pub is_terminal: bool,
    /// Value is known exactly; `final_scores` holds it.
    pub finalised: bool,
    pub final_scores: Vec<f32>,
    pub visits: u32,
    pub value_sum: Vec<f32>,
    pub inflight: u32,
    /// Incoming references: parent edges plus the evaluator's root hold.
    pub(crate) refs: u32,
}

impl PuctNode {
    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    pub fn is_expanded(&self) -> bool {
        self.status == EvalStatus::Expanded
    }

    pub fn needs_evaluation(&self) -> bool {
        !self.finalised && self.status == EvalStatus::Unevaluated
    }

    /// Final score if finalised, else mean backed-up value.
    pub fn current_score(&self, role: usize) -> f32 {
        if self.finalised {
            return self.final_scores[role];
        }
        if self.visits == 0 {
            0.0
        } else {
            self.value_sum[role] / self.visits as f32
        }
    }

    pub fn edge_for_move(&self, lead_move: u32) -> Option<usize> {
        self.children.iter().position(|e| e.lead_move == lead_move)
    }
}
