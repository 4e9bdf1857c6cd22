//! PUCT evaluator: tree walk, virtual loss, backup and move choice.
//!
//! The evaluator never blocks. `launch` walks one playout from the root and
//! either finishes it on the spot (solved leaf), parks it on a submitted
//! leaf request, or reports a collision with a leaf already waiting.
//! Parked playouts stay here until `collect` sees their prediction, which
//! means a search task can be dropped at any time: `abandon` undoes the
//! virtual visits of everything still parked and leaves a consistent tree.

use gz_core::{BaseState, ChooseFn, JointMove, PuctConfig, StateMachine};
use gz_features::Transformer;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Gamma};
use thiserror::Error;

use crate::arena::NodeId;
use crate::choose::{choose_temperature, choose_top_visits, temperature_for_depth};
use crate::infer::{BackendError, LeafBackend, Ticket};
use crate::node::{EvalStatus, PuctNode};
use crate::tree::{EdgeDebug, NodeDebug, NodeStore, TreeError};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no root established")]
    NoRoot,
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("search blocked with no evaluation outstanding")]
    Stalled,
}

#[derive(Debug, Clone, Default)]
pub struct SearchStats {
    /// Playouts that reached a leaf and were backed up.
    pub playouts: u64,
    /// Playouts that ended on a solved node without a network call.
    pub solved_playouts: u64,
    pub collisions: u64,
    pub max_inflight: usize,
    pub noise_applied: u64,
    pub abandoned: u64,
}

/// Outcome of one `launch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// Backed up immediately from a solved node.
    Completed,
    /// Waiting on a leaf prediction.
    Pending,
    /// Ran into a leaf that is already waiting; nothing was reserved.
    Collision,
}

/// Move picked at the root by the last finished search.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveChoice {
    pub edge: usize,
    pub lead_role: usize,
    pub lead_move: u32,
    pub joint: JointMove,
    pub child: Option<NodeId>,
    pub visits: u32,
    pub game_depth: u32,
}

struct Playout {
    path: Vec<(NodeId, usize)>,
    leaf: NodeId,
    ticket: Ticket,
}

pub struct PuctEvaluator {
    conf: PuctConfig,
    sm: Box<dyn StateMachine>,
    policy_count: usize,
    role_count: usize,
    store: NodeStore,
    root: Option<NodeId>,
    game_depth: u32,
    rng: ChaCha8Rng,
    playouts: Vec<Playout>,
    single: Option<(NodeId, Ticket)>,
    last_choice: Option<MoveChoice>,
    stats: SearchStats,
}

fn draw_depth(conf: &PuctConfig) -> u32 {
    conf.use_legals_count_draw.max(0) as u32
}

impl PuctEvaluator {
    pub fn new(
        sm: Box<dyn StateMachine>,
        transformer: &dyn Transformer,
        conf: PuctConfig,
        seed: u64,
    ) -> Self {
        let role_count = sm.role_count();
        let store = NodeStore::new(role_count, conf.lookup_transpositions, draw_depth(&conf));
        Self {
            policy_count: transformer.policy_count(),
            role_count,
            sm,
            store,
            conf,
            root: None,
            game_depth: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            playouts: Vec::new(),
            single: None,
            last_choice: None,
            stats: SearchStats::default(),
        }
    }

    pub fn config(&self) -> &PuctConfig {
        &self.conf
    }

    pub fn update_config(&mut self, conf: PuctConfig) {
        self.store
            .configure(conf.lookup_transpositions, draw_depth(&conf));
        self.conf = conf;
    }

    pub fn state_machine(&self) -> &dyn StateMachine {
        self.sm.as_ref()
    }

    pub fn role_count(&self) -> usize {
        self.role_count
    }

    /// Drop the whole tree. The next root is created at `game_depth`.
    pub fn reset(&mut self, game_depth: u32) {
        self.store.clear();
        self.root = None;
        self.game_depth = game_depth;
        self.playouts.clear();
        self.single = None;
        self.last_choice = None;
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn root_node(&self) -> Option<&PuctNode> {
        self.root.and_then(|id| self.store.get(id).ok())
    }

    pub fn node(&self, id: NodeId) -> Result<&PuctNode, TreeError> {
        self.store.get(id)
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn node_count(&self) -> usize {
        self.store.node_count()
    }

    pub fn game_depth(&self) -> u32 {
        self.game_depth
    }

    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    /// Playouts waiting on a prediction.
    pub fn inflight(&self) -> usize {
        self.playouts.len()
    }

    pub fn last_choice(&self) -> Option<&MoveChoice> {
        self.last_choice.as_ref()
    }

    pub fn take_choice(&mut self) -> Option<MoveChoice> {
        self.last_choice.take()
    }

    /// Use `state` as the new root, discarding the tree; `None` keeps the
    /// current root or starts from the initial state.
    pub fn establish_root(&mut self, state: Option<BaseState>) -> Result<NodeId, SearchError> {
        self.abandon();
        self.last_choice = None;
        let state = match (state, self.root) {
            (None, Some(root)) => return Ok(root),
            (Some(s), _) => s,
            (None, None) => self.sm.initial_state(),
        };
        self.store.clear();
        let id = self.store.create_root(self.sm.as_ref(), state, self.game_depth);
        self.root = Some(id);
        Ok(id)
    }

    /// Advance the root along `joint`, pruning what becomes unreachable.
    pub fn apply_move(&mut self, joint: &JointMove) -> Result<NodeId, SearchError> {
        self.abandon();
        self.last_choice = None;
        let root = self.root.ok_or(SearchError::NoRoot)?;
        let child = self.store.apply_move(self.sm.as_ref(), root, joint)?;
        self.root = Some(child);
        self.game_depth = self.store.get(child)?.game_depth;
        Ok(child)
    }

    /// Submit `node` for evaluation unless it has been evaluated already.
    /// Returns whether a request was made; see [`Self::poll_evaluation`].
    pub fn request_evaluation(
        &mut self,
        node: NodeId,
        backend: &mut dyn LeafBackend,
    ) -> Result<bool, SearchError> {
        let n = self.store.get(node)?;
        if !n.needs_evaluation() {
            return Ok(false);
        }
        let ticket = backend.submit(&n.state)?;
        self.store.get_mut(node)?.status = EvalStatus::Pending(ticket);
        self.single = Some((node, ticket));
        Ok(true)
    }

    /// True once no single-node evaluation is outstanding.
    pub fn poll_evaluation(&mut self, backend: &mut dyn LeafBackend) -> Result<bool, SearchError> {
        let Some((node, ticket)) = self.single else {
            return Ok(true);
        };
        match backend.try_recv(ticket)? {
            None => Ok(false),
            Some(p) => {
                self.single = None;
                self.store.expand(node, &p, self.policy_count)?;
                Ok(true)
            }
        }
    }

    /// Forget every outstanding request, removing its virtual visits and
    /// returning its leaf to the unevaluated state.
    pub fn abandon(&mut self) {
        let playouts = std::mem::take(&mut self.playouts);
        let single = self.single.take();
        let count = playouts.len() + usize::from(single.is_some());
        if count == 0 {
            return;
        }
        for p in playouts {
            self.remove_virtual_loss(&p.path);
            self.reset_pending(p.leaf);
        }
        if let Some((node, _)) = single {
            self.reset_pending(node);
        }
        self.stats.abandoned += count as u64;
        tracing::debug!(count, "abandoned outstanding evaluations");
    }

    fn reset_pending(&mut self, id: NodeId) {
        if let Ok(n) = self.store.get_mut(id) {
            if matches!(n.status, EvalStatus::Pending(_)) {
                n.status = EvalStatus::Unevaluated;
            }
        }
    }

    fn apply_virtual_loss(&mut self, path: &[(NodeId, usize)]) -> Result<(), TreeError> {
        for &(id, edge) in path {
            let n = self.store.get_mut(id)?;
            n.inflight += 1;
            n.children[edge].inflight += 1;
        }
        Ok(())
    }

    fn remove_virtual_loss(&mut self, path: &[(NodeId, usize)]) {
        for &(id, edge) in path {
            if let Ok(n) = self.store.get_mut(id) {
                n.inflight = n.inflight.saturating_sub(1);
                if let Some(e) = n.children.get_mut(edge) {
                    e.inflight = e.inflight.saturating_sub(1);
                }
            }
        }
    }

    /// Reset root priors and apply squash and Dirichlet noise as configured.
    pub fn apply_root_noise(&mut self) -> Result<(), SearchError> {
        let root = self.root.ok_or(SearchError::NoRoot)?;
        let conf = &self.conf;
        let n = self.store.get_mut(root)?;
        for e in &mut n.children {
            e.noisy_prior = e.prior;
        }
        let k = n.children.len();
        if k < 2 {
            return Ok(());
        }

        let mut noised = false;
        if conf.noise_policy_squash_prob > 0.0
            && self.rng.gen::<f32>() < conf.noise_policy_squash_prob
        {
            let s = conf.noise_policy_squash_pct;
            for e in &mut n.children {
                e.noisy_prior = (1.0 - s) * e.noisy_prior + s / k as f32;
            }
            noised = true;
        }

        if conf.dirichlet_noise_pct > 0.0 {
            let alpha = if conf.dirichlet_noise_alpha > 0.0 {
                conf.dirichlet_noise_alpha
            } else {
                10.0 / k as f32
            };
            if let Ok(gamma) = Gamma::new(alpha as f64, 1.0) {
                let eta: Vec<f64> = (0..k).map(|_| gamma.sample(&mut self.rng)).collect();
                let total: f64 = eta.iter().sum();
                if total > 0.0 && total.is_finite() {
                    let pct = conf.dirichlet_noise_pct;
                    for (e, x) in n.children.iter_mut().zip(eta) {
                        e.noisy_prior = (1.0 - pct) * e.noisy_prior + pct * (x / total) as f32;
                    }
                    noised = true;
                }
            }
        }

        if noised {
            self.stats.noise_applied += 1;
        }
        Ok(())
    }

    /// Back up every parked playout whose prediction has arrived, in the
    /// order the playouts were launched. Returns how many completed.
    pub fn collect(&mut self, backend: &mut dyn LeafBackend) -> Result<u32, SearchError> {
        let mut done = 0;
        let mut i = 0;
        while i < self.playouts.len() {
            match backend.try_recv(self.playouts[i].ticket)? {
                None => i += 1,
                Some(prediction) => {
                    let p = self.playouts.remove(i);
                    self.store.expand(p.leaf, &prediction, self.policy_count)?;
                    self.remove_virtual_loss(&p.path);
                    let values = self.store.get(p.leaf)?.value_sum.clone();
                    self.backup(&p.path, &values)?;
                    self.stats.playouts += 1;
                    done += 1;
                }
            }
        }
        Ok(done)
    }

    /// Walk one playout from the root. `forced_root_edge` overrides
    /// selection at the root.
    pub fn launch(
        &mut self,
        backend: &mut dyn LeafBackend,
        forced_root_edge: Option<usize>,
    ) -> Result<Launch, SearchError> {
        let root = self.root.ok_or(SearchError::NoRoot)?;
        let mut path: Vec<(NodeId, usize)> = Vec::new();
        let mut node = root;
        loop {
            let n = self.store.get(node)?;
            if n.finalised {
                let scores = n.final_scores.clone();
                self.backup(&path, &scores)?;
                self.stats.playouts += 1;
                self.stats.solved_playouts += 1;
                return Ok(Launch::Completed);
            }
            match n.status {
                EvalStatus::Pending(_) => {
                    self.stats.collisions += 1;
                    return Ok(Launch::Collision);
                }
                EvalStatus::Unevaluated => {
                    let ticket = backend.submit(&n.state)?;
                    self.store.get_mut(node)?.status = EvalStatus::Pending(ticket);
                    self.apply_virtual_loss(&path)?;
                    self.playouts.push(Playout {
                        path,
                        leaf: node,
                        ticket,
                    });
                    self.stats.max_inflight = self.stats.max_inflight.max(self.playouts.len());
                    return Ok(Launch::Pending);
                }
                EvalStatus::Expanded => {}
            }
            if n.children.is_empty() {
                // no legal moves but not terminal: back up what we know
                let scores: Vec<f32> = (0..self.role_count).map(|r| n.current_score(r)).collect();
                self.backup(&path, &scores)?;
                self.stats.playouts += 1;
                return Ok(Launch::Completed);
            }

            let edge = match forced_root_edge {
                Some(e) if node == root && e < n.children.len() => e,
                _ => self.select_edge(node, node == root)?,
            };
            let child = match self.store.get(node)?.children[edge].child {
                Some(c) => c,
                None => self.store.create_child(self.sm.as_ref(), node, edge)?,
            };
            path.push((node, edge));
            node = child;
        }
    }

    fn select_edge(&self, id: NodeId, is_root: bool) -> Result<usize, TreeError> {
        let n = self.store.get(id)?;
        let role = n.lead_role;
        let (c, discount) = if is_root {
            (self.conf.puct_constant_root, self.conf.fpu_prior_discount_root)
        } else {
            (self.conf.puct_constant, self.conf.fpu_prior_discount)
        };

        let visited_prior: f32 = n
            .children
            .iter()
            .filter(|e| e.effective_visits() > 0)
            .map(|e| e.noisy_prior)
            .sum();
        let fpu = (n.current_score(role) - discount * visited_prior.sqrt()).max(0.0);
        let sqrt_parent = ((n.visits + n.inflight) as f32).sqrt();

        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (i, e) in n.children.iter().enumerate() {
            let visits = e.effective_visits();
            let solved = e
                .child
                .and_then(|c| self.store.get(c).ok())
                .filter(|c| c.finalised);
            let q = match solved {
                Some(child) => child.final_scores[role],
                None if visits == 0 => fpu,
                None => e.mean_effective(role),
            };
            let score = q + c * e.noisy_prior * sqrt_parent / (1.0 + visits as f32);
            if score > best_score {
                best = i;
                best_score = score;
            }
        }
        Ok(best)
    }

    fn backup(&mut self, path: &[(NodeId, usize)], values: &[f32]) -> Result<(), TreeError> {
        for &(id, edge) in path.iter().rev() {
            let n = self.store.get_mut(id)?;
            let e = &mut n.children[edge];
            e.visits += 1;
            for (s, v) in e.value_sum.iter_mut().zip(values) {
                *s += v;
            }
            n.visits += 1;
            for (s, v) in n.value_sum.iter_mut().zip(values) {
                *s += v;
            }
        }
        if self.conf.backup_finalised {
            for &(id, _) in path.iter().rev() {
                if !self.try_finalise(id)? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Mark `id` solved when its lead role has a winning solved child, or
    /// when every child is solved. Returns whether `id` is now solved.
    fn try_finalise(&mut self, id: NodeId) -> Result<bool, TreeError> {
        let n = self.store.get(id)?;
        if n.finalised {
            return Ok(true);
        }
        if n.children.is_empty() {
            return Ok(false);
        }
        let lead = n.lead_role;
        let mut best: Option<(f32, &[f32])> = None;
        let mut all_solved = true;
        let mut win = None;
        for e in &n.children {
            match e.child.and_then(|c| self.store.get(c).ok()) {
                Some(c) if c.finalised => {
                    let s = c.final_scores[lead];
                    if s >= 1.0 {
                        win = Some(c.final_scores.clone());
                        break;
                    }
                    if best.map_or(true, |(b, _)| s > b) {
                        best = Some((s, c.final_scores.as_slice()));
                    }
                }
                _ => all_solved = false,
            }
        }
        let scores = match (win, best) {
            (Some(w), _) => w,
            (None, Some((_, b))) if all_solved => b.to_vec(),
            _ => return Ok(false),
        };
        let n = self.store.get_mut(id)?;
        n.finalised = true;
        n.final_scores = scores;
        Ok(true)
    }

    /// Top root child has more than `ratio` times the visits of every
    /// sibling.
    pub fn root_converged(&self) -> Result<bool, SearchError> {
        let root = self.root.ok_or(SearchError::NoRoot)?;
        let n = self.store.get(root)?;
        let Some(top) = choose_top_visits(&n.children, n.lead_role) else {
            return Ok(true);
        };
        let top_visits = n.children[top].visits as f32;
        let ratio = self.conf.top_visits_best_guess_converge_ratio;
        Ok(n
            .children
            .iter()
            .enumerate()
            .all(|(i, e)| i == top || top_visits > ratio * e.visits as f32))
    }

    /// Root value is known: the root is solved, or a root move wins outright.
    pub fn root_solved(&self) -> Result<bool, SearchError> {
        let root = self.root.ok_or(SearchError::NoRoot)?;
        let n = self.store.get(root)?;
        Ok(n.finalised || self.winning_edge(n).is_some())
    }

    fn winning_edge(&self, n: &PuctNode) -> Option<usize> {
        n.children.iter().position(|e| {
            e.child
                .and_then(|c| self.store.get(c).ok())
                .map_or(false, |c| c.finalised && c.final_scores[n.lead_role] >= 1.0)
        })
    }

    /// Least effectively visited edge among the first `max_count` root
    /// edges, plus whether those edges are already balanced (all have
    /// children and their visits differ by at most 5% of the largest, or
    /// by one).
    pub fn balance_state(&self, max_count: usize) -> Result<(usize, bool), SearchError> {
        let root = self.root.ok_or(SearchError::NoRoot)?;
        let n = self.store.get(root)?;
        let edges = &n.children[..max_count.min(n.children.len())];
        let mut least = 0;
        let mut min = u32::MAX;
        let mut max = 0;
        for (i, e) in edges.iter().enumerate() {
            let v = e.effective_visits();
            if v < min {
                min = v;
                least = i;
            }
            max = max.max(v);
        }
        let all_children = edges.iter().all(|e| e.child.is_some());
        let tolerance = (max / 20).max(1);
        Ok((least, all_children && max - min.min(max) <= tolerance))
    }

    /// Playouts needed to lift the first `max_count` root edges to the
    /// most visited one, plus one each for creating children.
    pub fn balance_budget(&self, max_count: usize) -> Result<u32, SearchError> {
        let root = self.root.ok_or(SearchError::NoRoot)?;
        let n = self.store.get(root)?;
        let edges = &n.children[..max_count.min(n.children.len())];
        let max = edges.iter().map(|e| e.visits).max().unwrap_or(0);
        let deficit: u32 = edges.iter().map(|e| max - e.visits).sum();
        Ok(deficit + edges.len() as u32)
    }

    /// Pick the move to play from the current root. `None` when the root
    /// has no moves.
    pub fn choose_move(&mut self) -> Result<Option<MoveChoice>, SearchError> {
        let root = self.root.ok_or(SearchError::NoRoot)?;
        let n = self.store.get(root)?;
        let lead = n.lead_role;
        let edge = match self.winning_edge(n) {
            Some(e) => Some(e),
            None => match self.conf.choose {
                ChooseFn::TopVisits => choose_top_visits(&n.children, lead),
                ChooseFn::Temperature => match temperature_for_depth(&self.conf, n.game_depth) {
                    Some(t) => choose_temperature(&n.children, lead, t, self.conf.random_scale, &mut self.rng)
                        .or_else(|| choose_top_visits(&n.children, lead)),
                    None => choose_top_visits(&n.children, lead),
                },
            },
        };
        let Some(edge) = edge else {
            return Ok(None);
        };
        let e = &n.children[edge];
        let choice = MoveChoice {
            edge,
            lead_role: lead,
            lead_move: e.lead_move,
            joint: e.joint.clone(),
            child: e.child,
            visits: e.visits,
            game_depth: n.game_depth,
        };
        tracing::debug!(
            depth = choice.game_depth,
            lead_role = lead,
            lead_move = choice.lead_move,
            visits = choice.visits,
            nodes = self.store.node_count(),
            "move chosen"
        );
        if self.conf.verbose {
            let dump = self.store.debug_snapshot(self.sm.as_ref(), root, self.conf.max_dump_depth)?;
            tracing::debug!("search tree\n{dump}");
        }
        self.last_choice = Some(choice.clone());
        Ok(Some(choice))
    }

    /// Snapshot of the root, `depth` levels deep.
    pub fn debug_root(&self, depth: u32) -> Result<NodeDebug, SearchError> {
        let root = self.root.ok_or(SearchError::NoRoot)?;
        Ok(self.store.debug_snapshot(self.sm.as_ref(), root, depth)?)
    }

    /// Snapshots of the first `max_count` root edges.
    pub fn debug_root_edges(&self, max_count: usize, depth: u32) -> Result<Vec<EdgeDebug>, SearchError> {
        let mut root = self.debug_root(depth)?;
        root.edges.truncate(max_count);
        Ok(root.edges)
    }
}
