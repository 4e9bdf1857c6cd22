//! Resumable search tasks.
//!
//! A task is a queue of [`Job`]s plus the progress of the simulation in
//! hand. `resume` runs until the task finishes or needs a prediction that
//! has not arrived; the caller delivers predictions through its
//! [`LeafBackend`] and resumes again. Everything a task needs between
//! resumptions is stored in the task or the evaluator, never on a stack.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use gz_core::{BaseState, JointMove};

use crate::evaluator::{Launch, MoveChoice, PuctEvaluator, SearchError};
use crate::infer::{Inference, InlineBackend, LeafBackend};

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// New root from the state, or keep the current one when `None`.
    EstablishRoot(Option<BaseState>),
    ApplyMove(JointMove),
    /// Search the root and choose a move. `evaluations == 0` with a deadline
    /// searches until the deadline.
    NextMove {
        evaluations: u32,
        deadline: Option<Instant>,
    },
    /// Even out visits across the first `max_count` root moves.
    Balance { max_count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Done,
    /// Waiting on predictions from the backend.
    Blocked,
}

/// Anything the scheduler can resume against an evaluator.
pub trait Continuation {
    fn resume(
        &mut self,
        ev: &mut PuctEvaluator,
        backend: &mut dyn LeafBackend,
    ) -> Result<Progress, SearchError>;
}

#[derive(Debug, Clone, Copy)]
enum SimMode {
    NextMove,
    Balance { max_count: usize, budget: u32 },
}

#[derive(Debug, Clone)]
struct Simulation {
    mode: SimMode,
    deadline: Option<Instant>,
    evaluations: u32,
    max_evaluations: u32,
    done: u32,
    launched: u32,
    checked_at: u32,
    converged_checks: u32,
    stopping: bool,
}

impl Simulation {
    fn start(job: &Job, ev: &mut PuctEvaluator) -> Result<Self, SearchError> {
        let conf = ev.config();
        let mut sim = Self {
            mode: SimMode::NextMove,
            deadline: None,
            evaluations: 0,
            max_evaluations: 0,
            done: 0,
            launched: 0,
            checked_at: 0,
            converged_checks: 0,
            stopping: false,
        };
        match *job {
            Job::NextMove {
                evaluations,
                deadline,
            } => {
                let think = (conf.think_time > 0.0)
                    .then(|| Instant::now() + Duration::from_secs_f32(conf.think_time));
                sim.deadline = match (deadline, think) {
                    (Some(d), Some(t)) => Some(d.min(t)),
                    (d, t) => d.or(t),
                };
                sim.evaluations = evaluations;
                let mult = conf.evaluation_multiplier_to_convergence;
                sim.max_evaluations = if mult > 1.0 {
                    (evaluations as f32 * mult).ceil() as u32
                } else {
                    evaluations
                };
                ev.apply_root_noise()?;
            }
            Job::Balance { max_count } => {
                let children = ev.root_node().map_or(0, |n| n.num_children());
                let max_count = max_count.min(children);
                sim.mode = SimMode::Balance {
                    max_count,
                    budget: ev.balance_budget(max_count)?,
                };
            }
            Job::EstablishRoot(_) | Job::ApplyMove(_) => {}
        }
        Ok(sim)
    }

    /// Evaluation count at which launching pauses.
    fn limit(&self) -> u32 {
        match self.mode {
            SimMode::Balance { budget, .. } => budget,
            SimMode::NextMove if self.evaluations == 0 && self.deadline.is_some() => u32::MAX,
            SimMode::NextMove if self.done >= self.evaluations => self.max_evaluations,
            SimMode::NextMove => self.evaluations,
        }
    }

    fn should_stop(&mut self, ev: &PuctEvaluator) -> Result<bool, SearchError> {
        if ev.root_solved()? {
            return Ok(true);
        }
        if self.deadline.map_or(false, |d| Instant::now() >= d) {
            return Ok(true);
        }
        if let SimMode::Balance { max_count, budget } = self.mode {
            let (_, balanced) = ev.balance_state(max_count)?;
            return Ok(max_count == 0 || balanced || self.launched >= budget);
        }

        let conf = ev.config();
        if conf.converged_visits > 0 && self.done != self.checked_at {
            self.checked_at = self.done;
            if ev.root_converged()? {
                self.converged_checks += 1;
            } else {
                self.converged_checks = 0;
            }
            if self.converged_checks >= conf.converged_visits {
                return Ok(true);
            }
        }

        if self.evaluations == 0 {
            return Ok(self.deadline.is_none());
        }
        if self.done >= self.evaluations {
            if self.done >= self.max_evaluations {
                return Ok(true);
            }
            return ev.root_converged();
        }
        Ok(false)
    }

    /// Launch and collect playouts. Returns true once the simulation has
    /// stopped and nothing is left in flight.
    fn step(
        &mut self,
        ev: &mut PuctEvaluator,
        backend: &mut dyn LeafBackend,
    ) -> Result<bool, SearchError> {
        self.done += ev.collect(backend)?;
        loop {
            if !self.stopping && self.should_stop(ev)? {
                self.stopping = true;
            }
            if self.stopping {
                return Ok(ev.inflight() == 0);
            }
            if backend.capacity_left() == 0 {
                return Ok(false);
            }
            let used = match self.mode {
                SimMode::Balance { .. } => self.launched,
                SimMode::NextMove => self.done + ev.inflight() as u32,
            };
            if used >= self.limit() {
                if ev.inflight() == 0 {
                    self.stopping = true;
                    continue;
                }
                return Ok(false);
            }
            let forced = match self.mode {
                SimMode::Balance { max_count, .. } => Some(ev.balance_state(max_count)?.0),
                SimMode::NextMove => None,
            };
            match ev.launch(backend, forced)? {
                Launch::Completed => {
                    self.done += 1;
                    self.launched += 1;
                }
                Launch::Pending => self.launched += 1,
                Launch::Collision => {
                    if ev.inflight() == 0 {
                        return Err(SearchError::Stalled);
                    }
                    return Ok(false);
                }
            }
        }
    }
}

/// Queue of jobs run against one evaluator.
#[derive(Debug, Clone, Default)]
pub struct SearchTask {
    jobs: VecDeque<Job>,
    sim: Option<Simulation>,
    choice: Option<MoveChoice>,
    started: bool,
}

impl SearchTask {
    pub fn new(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: jobs.into_iter().collect(),
            sim: None,
            choice: None,
            started: false,
        }
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub fn is_finished(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Move chosen by the last finished `NextMove` job.
    pub fn choice(&self) -> Option<&MoveChoice> {
        self.choice.as_ref()
    }

    pub fn take_choice(&mut self) -> Option<MoveChoice> {
        self.choice.take()
    }
}

impl Continuation for SearchTask {
    fn resume(
        &mut self,
        ev: &mut PuctEvaluator,
        backend: &mut dyn LeafBackend,
    ) -> Result<Progress, SearchError> {
        if !self.started {
            // requests left by a dropped task belong to a backend that no
            // longer knows their tickets
            self.started = true;
            ev.abandon();
        }
        loop {
            if !ev.poll_evaluation(backend)? {
                return Ok(Progress::Blocked);
            }
            let Some(job) = self.jobs.front_mut() else {
                return Ok(Progress::Done);
            };
            match job {
                Job::EstablishRoot(state) => {
                    let state = state.take();
                    self.jobs.pop_front();
                    let root = ev.establish_root(state)?;
                    ev.request_evaluation(root, backend)?;
                }
                Job::ApplyMove(joint) => {
                    let joint = joint.clone();
                    self.jobs.pop_front();
                    let root = ev.apply_move(&joint)?;
                    ev.request_evaluation(root, backend)?;
                }
                Job::NextMove { .. } | Job::Balance { .. } => {
                    if self.sim.is_none() {
                        ev.abandon();
                        let root = ev.root().ok_or(SearchError::NoRoot)?;
                        if ev.request_evaluation(root, backend)? {
                            continue;
                        }
                        self.sim = Some(Simulation::start(job, ev)?);
                    }
                    let finished = match self.sim.as_mut() {
                        Some(sim) => sim.step(ev, backend)?,
                        None => continue,
                    };
                    if !finished {
                        return Ok(Progress::Blocked);
                    }
                    let sim = self.sim.take();
                    if matches!(job, Job::NextMove { .. }) {
                        self.choice = ev.choose_move()?;
                        if let Some(sim) = sim {
                            tracing::debug!(
                                evaluations = sim.done,
                                nodes = ev.node_count(),
                                "search finished"
                            );
                        }
                    }
                    self.jobs.pop_front();
                }
            }
        }
    }
}

/// Run `task` to completion against an in-process backend.
pub fn drive_inline<C, I>(
    task: &mut C,
    ev: &mut PuctEvaluator,
    backend: &mut InlineBackend<'_, I>,
) -> Result<(), SearchError>
where
    C: Continuation + ?Sized,
    I: Inference,
{
    loop {
        match task.resume(ev, backend)? {
            Progress::Done => return Ok(()),
            Progress::Blocked => {
                if backend.flush() == 0 {
                    return Err(SearchError::Stalled);
                }
            }
        }
    }
}
