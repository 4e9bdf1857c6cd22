//! Self-play: one continuation plays a whole game and records samples.
//!
//! Every ply is an inner [`SearchTask`]; between plies the game task checks
//! for the end of the game, decides whether the next search is sampled and
//! applies the resign and run-to-end rules.

use gz_core::game::final_scores;
use gz_core::{BaseState, ConfigError, JointMove, SelfPlayConfig, StateMachine};
use gz_features::Transformer;
use gz_infer::{BatchShape, BoundaryError, ClientError, InferenceHost, PredictionView};
use gz_mcts::{
    visit_policy, Continuation, Job, LeafBackend, Progress, PuctEvaluator, SearchError,
    SearchTask,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::drive::{drive, PollDriver};
use crate::scheduler::{ReadyEvent, Scheduler, SchedulerError, SchedulerStats};

#[derive(Debug, Error)]
pub enum SelfPlayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("self-player failed earlier; start a new game")]
    Failed,
    #[error("game finished without an outcome")]
    NoOutcome,
    #[error(transparent)]
    Boundary(#[from] BoundaryError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// One training position.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub state: BaseState,
    pub lead_role: usize,
    /// Visit distribution over the lead role's move table.
    pub policy: Vec<f32>,
    pub game_depth: u32,
    /// Final scores of the game, filled in when it ends.
    pub scores: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameEnd {
    Terminal,
    Resigned { role: usize },
    /// Ran to the end and the role's score fell below the early-end cutoff.
    EarlyLoss { role: usize },
    RepetitionDraw,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameOutcome {
    pub scores: Vec<f32>,
    pub game_depth: u32,
    pub end: GameEnd,
    pub samples: Vec<Sample>,
    pub moves: Vec<JointMove>,
    /// A resign was overridden and the game was played out.
    pub run_to_end: bool,
}

struct Ply {
    search: SearchTask,
    sampled: bool,
}

pub struct SelfPlayTask {
    conf: SelfPlayConfig,
    rng: ChaCha8Rng,
    state: BaseState,
    game_depth: u32,
    resign_threshold: Option<f32>,
    run_to_end: bool,
    started: bool,
    samples: Vec<Sample>,
    moves: Vec<JointMove>,
    seen: FxHashMap<BaseState, u32>,
    ply: Option<Ply>,
    outcome: Option<GameOutcome>,
}

impl SelfPlayTask {
    pub fn new(conf: SelfPlayConfig, initial: BaseState, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let resign_threshold = if rng.gen::<f32>() < conf.resign0_pct {
            Some(conf.resign0_score_probability)
        } else if rng.gen::<f32>() < conf.resign1_pct {
            Some(conf.resign1_score_probability)
        } else {
            None
        };
        let mut seen = FxHashMap::default();
        seen.insert(initial.clone(), 1);
        Self {
            conf,
            rng,
            state: initial,
            game_depth: 0,
            resign_threshold,
            run_to_end: false,
            started: false,
            samples: Vec::new(),
            moves: Vec::new(),
            seen,
            ply: None,
            outcome: None,
        }
    }

    pub fn resign_threshold(&self) -> Option<f32> {
        self.resign_threshold
    }

    pub fn game_depth(&self) -> u32 {
        self.game_depth
    }

    pub fn outcome(&self) -> Option<&GameOutcome> {
        self.outcome.as_ref()
    }

    pub fn take_outcome(&mut self) -> Option<GameOutcome> {
        self.outcome.take()
    }

    fn finish(&mut self, end: GameEnd, scores: Vec<f32>) {
        let mut samples = std::mem::take(&mut self.samples);
        if end == GameEnd::Aborted {
            samples.clear();
        }
        for s in &mut samples {
            s.scores = scores.clone();
        }
        tracing::debug!(
            ?end,
            depth = self.game_depth,
            samples = samples.len(),
            run_to_end = self.run_to_end,
            "self-play game finished"
        );
        self.outcome = Some(GameOutcome {
            scores,
            game_depth: self.game_depth,
            end,
            samples,
            moves: std::mem::take(&mut self.moves),
            run_to_end: self.run_to_end,
        });
    }

    /// End the game before searching, if the current state calls for it.
    fn check_end(&mut self, sm: &dyn StateMachine) -> bool {
        let roles = sm.role_count();
        if sm.is_terminal(&self.state) {
            let scores = final_scores(sm, &self.state);
            self.finish(GameEnd::Terminal, scores);
            return true;
        }
        if self.conf.abort_max_length > 0 && self.game_depth >= self.conf.abort_max_length {
            self.finish(GameEnd::Aborted, vec![0.5; roles]);
            return true;
        }
        let repeats = self.seen.get(&self.state).copied().unwrap_or(0);
        if self.conf.number_repeat_states_draw > 0 && repeats >= self.conf.number_repeat_states_draw
        {
            self.finish(
                GameEnd::RepetitionDraw,
                vec![self.conf.repeat_states_score; roles],
            );
            return true;
        }
        false
    }

    fn start_ply(&mut self) {
        let sampled = !self.run_to_end && self.rng.gen::<f32>() < self.conf.oscillate_sampling_pct;
        let evaluations = if self.run_to_end {
            self.conf.run_to_end_evals
        } else if sampled {
            self.conf.evals_per_move
        } else {
            (self.conf.evals_per_move / 4).max(1)
        };
        let first = match self.moves.last() {
            Some(joint) => Job::ApplyMove(joint.clone()),
            None => Job::EstablishRoot(Some(self.state.clone())),
        };
        let search = SearchTask::new([
            first,
            Job::NextMove {
                evaluations,
                deadline: None,
            },
        ]);
        self.ply = Some(Ply { search, sampled });
    }

    fn finish_ply(&mut self, ev: &mut PuctEvaluator, mut ply: Ply) -> Result<(), SearchError> {
        let roles = ev.role_count();
        let root = ev.root_node().ok_or(SearchError::NoRoot)?;
        let lead = root.lead_role;
        let Some(choice) = ply.search.take_choice() else {
            // non-terminal without moves: score what the search knows
            let scores = (0..roles).map(|r| root.current_score(r)).collect();
            self.finish(GameEnd::Terminal, scores);
            return Ok(());
        };

        if ply.sampled {
            let move_count = ev.state_machine().move_count(lead);
            self.samples.push(Sample {
                state: self.state.clone(),
                lead_role: lead,
                policy: visit_policy(
                    &root.children,
                    lead,
                    move_count,
                    self.conf.temperature_for_policy,
                ),
                game_depth: self.game_depth,
                scores: Vec::new(),
            });
        }

        let score = match choice.child.and_then(|c| ev.node(c).ok()) {
            Some(child) => child.current_score(lead),
            None => root.current_score(lead),
        };
        let mut loss = vec![1.0; roles];
        loss[lead] = 0.0;

        if self.run_to_end {
            if score < self.conf.run_to_end_early_score {
                self.finish(GameEnd::EarlyLoss { role: lead }, loss);
                return Ok(());
            }
        } else if let Some(threshold) = self.resign_threshold {
            if self.game_depth >= self.conf.run_to_end_minimum_game_depth && score < threshold {
                if self.rng.gen::<f32>() < self.conf.run_to_end_pct {
                    tracing::debug!(depth = self.game_depth, score, "resign overridden, running to end");
                    self.run_to_end = true;
                    ev.update_config(self.conf.run_to_end_puct_config.clone());
                } else {
                    self.finish(GameEnd::Resigned { role: lead }, loss);
                    return Ok(());
                }
            }
        }

        self.state = ev.state_machine().next_state(&self.state, &choice.joint);
        self.game_depth += 1;
        self.moves.push(choice.joint);
        *self.seen.entry(self.state.clone()).or_insert(0) += 1;
        Ok(())
    }
}

impl Continuation for SelfPlayTask {
    fn resume(
        &mut self,
        ev: &mut PuctEvaluator,
        backend: &mut dyn LeafBackend,
    ) -> Result<Progress, SearchError> {
        if !self.started {
            self.started = true;
            ev.update_config(self.conf.puct_config.clone());
            ev.reset(0);
        }
        loop {
            if self.outcome.is_some() {
                return Ok(Progress::Done);
            }
            if let Some(ply) = self.ply.as_mut() {
                if ply.search.resume(ev, backend)? == Progress::Blocked {
                    return Ok(Progress::Blocked);
                }
                if let Some(ply) = self.ply.take() {
                    self.finish_ply(ev, ply)?;
                }
                continue;
            }
            if !self.check_end(ev.state_machine()) {
                self.start_ply();
            }
        }
    }
}

/// Plays self-play games against an inference host, one at a time.
pub struct SelfPlayer {
    scheduler: Scheduler<SelfPlayTask>,
    ev: PuctEvaluator,
    conf: SelfPlayConfig,
    failed: bool,
}

impl SelfPlayer {
    pub fn new(
        sm: Box<dyn StateMachine>,
        transformer: Box<dyn Transformer>,
        conf: SelfPlayConfig,
        seed: u64,
    ) -> Result<Self, SelfPlayError> {
        conf.validate()?;
        let ev = PuctEvaluator::new(sm, transformer.as_ref(), conf.puct_config.clone(), seed);
        Ok(Self {
            scheduler: Scheduler::new(transformer, conf.puct_config.batch_size),
            ev,
            conf,
            failed: false,
        })
    }

    pub fn config(&self) -> &SelfPlayConfig {
        &self.conf
    }

    pub fn start_game(&mut self, seed: u64) -> Result<(), SelfPlayError> {
        let initial = self.ev.state_machine().initial_state();
        self.failed = false;
        self.scheduler.create_main_loop();
        self.ev.abandon();
        self.scheduler
            .add_runnable(SelfPlayTask::new(self.conf.clone(), initial, seed))?;
        Ok(())
    }

    pub fn poll(&mut self, predictions: &PredictionView<'_>) -> Result<ReadyEvent<'_>, SelfPlayError> {
        if self.failed {
            return Err(SelfPlayError::Failed);
        }
        match self.scheduler.poll(&mut self.ev, predictions) {
            Ok(event) => Ok(event),
            Err(e) => {
                self.failed = true;
                Err(e.into())
            }
        }
    }

    pub fn take_outcome(&mut self) -> Option<GameOutcome> {
        self.scheduler.task_mut()?.take_outcome()
    }

    pub fn evaluator(&self) -> &PuctEvaluator {
        &self.ev
    }

    pub fn batch_shape(&self) -> &BatchShape {
        self.scheduler.shape()
    }

    /// Totals since construction, across games.
    pub fn scheduler_stats(&self) -> &SchedulerStats {
        self.scheduler.stats()
    }

    /// Play one full game against `host`.
    pub fn play_game<H: InferenceHost + ?Sized>(
        &mut self,
        host: &mut H,
        seed: u64,
    ) -> Result<GameOutcome, SelfPlayError> {
        self.start_game(seed)?;
        drive(self, host)?;
        self.take_outcome().ok_or(SelfPlayError::NoOutcome)
    }
}

impl PollDriver for SelfPlayer {
    type Error = SelfPlayError;

    fn batch_shape(&self) -> &BatchShape {
        SelfPlayer::batch_shape(self)
    }

    fn poll_batch(
        &mut self,
        predictions: &PredictionView<'_>,
    ) -> Result<ReadyEvent<'_>, SelfPlayError> {
        self.poll(predictions)
    }
}
