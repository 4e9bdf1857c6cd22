//! Player: one evaluator and one scheduler behind a poll interface.
//!
//! Lifecycle calls (`apply_move`, `begin_move`, `balance`) only queue work;
//! the caller then polls until [`ReadyEvent::Done`], predicting every batch
//! it is handed in between.

use std::time::Instant;

use gz_core::{BaseState, ConfigError, JointMove, PuctConfig, StateMachine};
use gz_features::Transformer;
use gz_infer::{BatchShape, BoundaryError, ClientError, PredictionView};
use gz_mcts::{EdgeDebug, Job, PuctEvaluator, SearchError, SearchTask};
use thiserror::Error;

use crate::drive::PollDriver;
use crate::scheduler::{ReadyEvent, Scheduler, SchedulerError, SchedulerStats};

/// Depth of the subtrees returned by [`Player::tree_debug`].
const TREE_DEBUG_DEPTH: u32 = 10;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("player failed earlier; reset it before polling again")]
    Failed,
    #[error(transparent)]
    Boundary(#[from] BoundaryError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChosenMove {
    /// Move of the requested role in the chosen joint move.
    pub move_index: u32,
    /// The role's current score at the chosen child, if it exists.
    pub probability: Option<f32>,
    pub node_count: usize,
}

pub struct Player {
    scheduler: Scheduler<SearchTask>,
    ev: PuctEvaluator,
    first_play: bool,
    failed: bool,
}

impl Player {
    pub fn new(
        sm: Box<dyn StateMachine>,
        transformer: Box<dyn Transformer>,
        conf: PuctConfig,
        seed: u64,
    ) -> Result<Self, PlayerError> {
        conf.validate()?;
        let batch_size = conf.batch_size;
        let ev = PuctEvaluator::new(sm, transformer.as_ref(), conf, seed);
        Ok(Self {
            scheduler: Scheduler::new(transformer, batch_size),
            ev,
            first_play: true,
            failed: false,
        })
    }

    pub fn update_config(&mut self, think_time: f32, converged_visits: u32, verbose: bool) {
        let conf = PuctConfig {
            think_time,
            converged_visits,
            verbose,
            ..self.ev.config().clone()
        };
        self.ev.update_config(conf);
    }

    /// Drop the tree and any queued work. The next lifecycle call
    /// establishes a fresh root.
    pub fn reset(&mut self, game_depth: u32) {
        self.scheduler.create_main_loop();
        self.ev.reset(game_depth);
        self.first_play = true;
        self.failed = false;
    }

    fn start(&mut self, jobs: Vec<Job>) -> Result<(), PlayerError> {
        self.scheduler.create_main_loop();
        self.ev.abandon();
        self.scheduler.add_runnable(SearchTask::new(jobs))?;
        Ok(())
    }

    pub fn apply_move(&mut self, joint: JointMove) -> Result<(), PlayerError> {
        let mut jobs = Vec::with_capacity(2);
        if std::mem::take(&mut self.first_play) {
            jobs.push(Job::EstablishRoot(None));
        }
        jobs.push(Job::ApplyMove(joint));
        self.start(jobs)
    }

    /// Search from `state` (or the current root after the first play).
    /// `end_time` bounds the search in addition to `evaluations`.
    pub fn begin_move(
        &mut self,
        state: BaseState,
        evaluations: u32,
        end_time: Option<Instant>,
    ) -> Result<(), PlayerError> {
        let mut jobs = Vec::with_capacity(2);
        if std::mem::take(&mut self.first_play) {
            jobs.push(Job::EstablishRoot(Some(state)));
        }
        jobs.push(Job::NextMove {
            evaluations,
            deadline: end_time,
        });
        self.start(jobs)
    }

    /// Move chosen by the last finished `begin_move`, seen from `role`.
    pub fn get_move(&self, role: usize) -> Option<ChosenMove> {
        let choice = self.scheduler.task()?.choice()?;
        let probability = choice
            .child
            .and_then(|c| self.ev.node(c).ok())
            .map(|n| n.current_score(role));
        Some(ChosenMove {
            move_index: choice.joint.get(role),
            probability,
            node_count: self.ev.node_count(),
        })
    }

    /// Even out visits over the first `max_count` root moves. Without a
    /// root there is nothing to balance and the next poll is `Done`.
    pub fn balance(&mut self, max_count: usize) -> Result<(), PlayerError> {
        if self.ev.root().is_none() {
            self.scheduler.create_main_loop();
            self.ev.abandon();
            return Ok(());
        }
        self.start(vec![Job::Balance { max_count }])
    }

    /// Root edges (at most `max_count`) with their subtrees.
    pub fn tree_debug(&self, max_count: usize) -> Result<Vec<EdgeDebug>, PlayerError> {
        if self.ev.root().is_none() {
            return Ok(Vec::new());
        }
        Ok(self.ev.debug_root_edges(max_count, TREE_DEBUG_DEPTH)?)
    }

    pub fn poll(&mut self, predictions: &PredictionView<'_>) -> Result<ReadyEvent<'_>, PlayerError> {
        if self.failed {
            return Err(PlayerError::Failed);
        }
        match self.scheduler.poll(&mut self.ev, predictions) {
            Ok(event) => Ok(event),
            Err(e) => {
                self.failed = true;
                Err(e.into())
            }
        }
    }

    pub fn batch_shape(&self) -> &BatchShape {
        self.scheduler.shape()
    }

    pub fn evaluator(&self) -> &PuctEvaluator {
        &self.ev
    }

    pub fn scheduler_stats(&self) -> &SchedulerStats {
        self.scheduler.stats()
    }

    pub fn node_count(&self) -> usize {
        self.ev.node_count()
    }
}

impl PollDriver for Player {
    type Error = PlayerError;

    fn batch_shape(&self) -> &BatchShape {
        Player::batch_shape(self)
    }

    fn poll_batch(&mut self, predictions: &PredictionView<'_>) -> Result<ReadyEvent<'_>, PlayerError> {
        self.poll(predictions)
    }
}
