//! Node store: owns every node of the search tree.
//!
//! Nodes live in an [`Arena`]. Each node counts its incoming references (one
//! per parent edge, plus one while it is the root); `release` frees whatever
//! drops to zero and walks on into its children, so pruning after a move
//! costs time proportional to what is pruned.

use std::fmt;

use gz_core::game::final_scores;
use gz_core::{BaseState, JointMove, StateMachine};
use thiserror::Error;

use crate::arena::{Arena, NodeId};
use crate::infer::Prediction;
use crate::node::{EvalStatus, PuctEdge, PuctNode};
use crate::state_key::state_key;
use crate::transposition::TranspositionTable;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("node {0:?} is no longer live")]
    Stale(NodeId),
    #[error("node {0:?} expanded twice")]
    AlreadyExpanded(NodeId),
    #[error("node {node:?} has no edge {edge}")]
    NoSuchEdge { node: NodeId, edge: usize },
    #[error("move {lead_move} of role {role} is not legal at node {node:?}")]
    IllegalMove {
        node: NodeId,
        role: usize,
        lead_move: u32,
    },
    #[error("malformed prediction for node {node:?}: {reason}")]
    MalformedPrediction { node: NodeId, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct TreeStats {
    pub created: u64,
    pub freed: u64,
    pub expansions: u64,
    /// Expansions whose policy row was unusable and fell back to uniform priors.
    pub prior_fallbacks: u64,
    pub transposition_hits: u64,
}

pub struct NodeStore {
    arena: Arena<PuctNode>,
    transpositions: TranspositionTable,
    use_transpositions: bool,
    legals_draw_depth: u32,
    role_count: usize,
    stats: TreeStats,
}

impl NodeStore {
    /// `legals_draw_depth == 0` disables depth draws.
    pub fn new(role_count: usize, use_transpositions: bool, legals_draw_depth: u32) -> Self {
        Self {
            arena: Arena::new(),
            transpositions: TranspositionTable::new(),
            use_transpositions,
            legals_draw_depth,
            role_count,
            stats: TreeStats::default(),
        }
    }

    pub fn configure(&mut self, use_transpositions: bool, legals_draw_depth: u32) {
        if !use_transpositions {
            self.transpositions.clear();
        }
        self.use_transpositions = use_transpositions;
        self.legals_draw_depth = legals_draw_depth;
    }

    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    pub fn transposition_count(&self) -> usize {
        self.transpositions.len()
    }

    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    pub fn get(&self, id: NodeId) -> Result<&PuctNode, TreeError> {
        self.arena.get(id).ok_or(TreeError::Stale(id))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut PuctNode, TreeError> {
        self.arena.get_mut(id).ok_or(TreeError::Stale(id))
    }

    pub fn clear(&mut self) {
        self.arena.clear();
        self.transpositions.clear();
    }

    fn make_node(&self, sm: &dyn StateMachine, state: BaseState, game_depth: u32) -> PuctNode {
        let roles = self.role_count;
        let mut node = PuctNode {
            state,
            game_depth,
            lead_role: 0,
            children: Vec::new(),
            status: EvalStatus::Unevaluated,
            is_terminal: false,
            finalised: false,
            final_scores: Vec::new(),
            visits: 0,
            value_sum: vec![0.0; roles],
            inflight: 0,
            refs: 1,
        };

        if sm.is_terminal(&node.state) {
            node.is_terminal = true;
            node.final_scores = final_scores(sm, &node.state);
        } else if self.legals_draw_depth > 0 && game_depth >= self.legals_draw_depth {
            node.final_scores = vec![0.5; roles];
        } else {
            let legals: Vec<Vec<u32>> = (0..roles).map(|r| sm.legal_moves(&node.state, r)).collect();
            let lead = legals.iter().position(|l| l.len() > 1).unwrap_or(0);
            node.lead_role = lead;
            node.children = legals[lead]
                .iter()
                .map(|&m| {
                    let mut joint = JointMove::new(roles);
                    for (r, l) in legals.iter().enumerate() {
                        joint.set(r, if r == lead { m } else { l.first().copied().unwrap_or(0) });
                    }
                    PuctEdge::new(m, joint, roles)
                })
                .collect();
            return node;
        }

        // Terminal or drawn by depth: nothing to evaluate.
        node.finalised = true;
        node.status = EvalStatus::Expanded;
        node.visits = 1;
        node.value_sum = node.final_scores.clone();
        node
    }

    /// New root. The caller holds the root reference.
    pub fn create_root(&mut self, sm: &dyn StateMachine, state: BaseState, game_depth: u32) -> NodeId {
        let key = self.use_transpositions.then(|| state_key(&state, game_depth));
        let node = self.make_node(sm, state, game_depth);
        let id = self.arena.insert(node);
        self.stats.created += 1;
        if let Some(key) = key {
            self.transpositions.insert(key, id);
        }
        id
    }

    /// Child behind edge `edge` of `parent`, created (or found by
    /// transposition) if the edge has none yet.
    pub fn create_child(
        &mut self,
        sm: &dyn StateMachine,
        parent: NodeId,
        edge: usize,
    ) -> Result<NodeId, TreeError> {
        let p = self.get(parent)?;
        let e = p
            .children
            .get(edge)
            .ok_or(TreeError::NoSuchEdge { node: parent, edge })?;
        if let Some(child) = e.child {
            return Ok(child);
        }
        let state = sm.next_state(&p.state, &e.joint);
        let depth = p.game_depth + 1;

        let key = self.use_transpositions.then(|| state_key(&state, depth));
        let found = match &key {
            Some(k) => self.transpositions.lookup(k, &self.arena),
            None => None,
        };
        let child = match found {
            Some(id) => {
                self.get_mut(id)?.refs += 1;
                self.stats.transposition_hits += 1;
                id
            }
            None => {
                let node = self.make_node(sm, state, depth);
                let id = self.arena.insert(node);
                self.stats.created += 1;
                if let Some(key) = key {
                    self.transpositions.insert(key, id);
                }
                id
            }
        };
        self.get_mut(parent)?.children[edge].child = Some(child);
        Ok(child)
    }

    /// Apply a delivered prediction. Returns true when the policy row was
    /// degenerate and uniform priors were used instead.
    pub fn expand(
        &mut self,
        id: NodeId,
        prediction: &Prediction,
        policy_count: usize,
    ) -> Result<bool, TreeError> {
        let roles = self.role_count;
        let node = self.arena.get_mut(id).ok_or(TreeError::Stale(id))?;
        if node.status == EvalStatus::Expanded {
            return Err(TreeError::AlreadyExpanded(id));
        }
        let malformed = |reason: String| TreeError::MalformedPrediction { node: id, reason };

        if prediction.values.len() != roles {
            return Err(malformed(format!(
                "{} values, expected {roles}",
                prediction.values.len()
            )));
        }
        if prediction.values.iter().any(|v| !v.is_finite()) {
            return Err(malformed("non-finite value".to_string()));
        }
        let head = if policy_count > 1 { node.lead_role } else { 0 };
        let row = prediction
            .policies
            .get(head)
            .ok_or_else(|| malformed(format!("missing policy head {head}")))?;

        let mut raw = Vec::with_capacity(node.children.len());
        for e in &node.children {
            let p = row.get(e.lead_move as usize).copied().ok_or_else(|| {
                malformed(format!(
                    "policy row of length {} lacks move {}",
                    row.len(),
                    e.lead_move
                ))
            })?;
            raw.push(p);
        }
        let sum: f32 = raw.iter().map(|p| p.max(0.0)).sum();
        let fallback = !(sum.is_finite() && sum > 0.0) || raw.iter().any(|p| !p.is_finite());
        let uniform = 1.0 / node.children.len().max(1) as f32;
        for (e, p) in node.children.iter_mut().zip(raw) {
            e.prior = if fallback { uniform } else { p.max(0.0) / sum };
            e.noisy_prior = e.prior;
        }

        node.visits = 1;
        node.value_sum = prediction.values.iter().map(|v| v.clamp(0.0, 1.0)).collect();
        node.status = EvalStatus::Expanded;

        self.stats.expansions += 1;
        if fallback {
            self.stats.prior_fallbacks += 1;
            tracing::debug!(node = ?id, "degenerate policy row, using uniform priors");
        }
        Ok(fallback)
    }

    /// Advance from `root` along the edge matching `joint` and release
    /// everything no longer reachable. Returns the new root.
    pub fn apply_move(
        &mut self,
        sm: &dyn StateMachine,
        root: NodeId,
        joint: &JointMove,
    ) -> Result<NodeId, TreeError> {
        let r = self.get(root)?;
        let role = r.lead_role;
        let lead_move = joint.get(role);
        let edge = r.edge_for_move(lead_move).ok_or(TreeError::IllegalMove {
            node: root,
            role,
            lead_move,
        })?;
        let child = self.create_child(sm, root, edge)?;
        self.get_mut(child)?.refs += 1;
        self.release(root);
        Ok(child)
    }

    /// Drop one reference to `id`, freeing it and any descendants that
    /// become unreferenced.
    pub fn release(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(node) = self.arena.get_mut(id) else {
                continue;
            };
            node.refs = node.refs.saturating_sub(1);
            if node.refs > 0 {
                continue;
            }
            let Some(node) = self.arena.remove(id) else {
                continue;
            };
            self.stats.freed += 1;
            if !self.transpositions.is_empty() {
                self.transpositions
                    .forget(&state_key(&node.state, node.game_depth), id);
            }
            stack.extend(node.children.iter().filter_map(|e| e.child));
        }
    }

    pub fn debug_snapshot(
        &self,
        sm: &dyn StateMachine,
        id: NodeId,
        depth: u32,
    ) -> Result<NodeDebug, TreeError> {
        let n = self.get(id)?;
        let roles = self.role_count;
        let mut edges = Vec::with_capacity(n.children.len());
        for e in &n.children {
            let child = match e.child {
                Some(c) if depth > 0 => Some(self.debug_snapshot(sm, c, depth - 1)?),
                _ => None,
            };
            edges.push(EdgeDebug {
                move_name: sm.move_name(n.lead_role, e.lead_move),
                lead_move: e.lead_move,
                visits: e.visits,
                inflight: e.inflight,
                prior: e.prior,
                noisy_prior: e.noisy_prior,
                mean: (0..roles).map(|r| e.mean(r)).collect(),
                child,
            });
        }
        Ok(NodeDebug {
            game_depth: n.game_depth,
            lead_role: n.lead_role,
            visits: n.visits,
            scores: (0..roles).map(|r| n.current_score(r)).collect(),
            is_terminal: n.is_terminal,
            finalised: n.finalised,
            edges,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NodeDebug {
    pub game_depth: u32,
    pub lead_role: usize,
    pub visits: u32,
    pub scores: Vec<f32>,
    pub is_terminal: bool,
    pub finalised: bool,
    pub edges: Vec<EdgeDebug>,
}

#[derive(Debug, Clone)]
pub struct EdgeDebug {
    pub move_name: String,
    pub lead_move: u32,
    pub visits: u32,
    pub inflight: u32,
    pub prior: f32,
    pub noisy_prior: f32,
    pub mean: Vec<f32>,
    pub child: Option<NodeDebug>,
}

fn fmt_scores(f: &mut fmt::Formatter<'_>, scores: &[f32]) -> fmt::Result {
    write!(f, "[")?;
    for (i, s) in scores.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{s:.3}")?;
    }
    write!(f, "]")
}

impl NodeDebug {
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        write!(
            f,
            "{:indent$}depth={} lead={} visits={} scores=",
            "",
            self.game_depth,
            self.lead_role,
            self.visits
        )?;
        fmt_scores(f, &self.scores)?;
        if self.finalised {
            write!(f, " final")?;
        }
        writeln!(f)?;
        for e in &self.edges {
            e.write_indented(f, indent + 2)?;
        }
        Ok(())
    }
}

impl EdgeDebug {
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        write!(
            f,
            "{:indent$}{} visits={} p={:.3} np={:.3} q=",
            "", self.move_name, self.visits, self.prior, self.noisy_prior
        )?;
        fmt_scores(f, &self.mean)?;
        writeln!(f)?;
        if let Some(c) = &self.child {
            c.write_indented(f, indent + 2)?;
        }
        Ok(())
    }
}

impl fmt::Display for NodeDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

impl fmt::Display for EdgeDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}
