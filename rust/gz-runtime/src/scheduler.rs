//! Batching scheduler.
//!
//! Runs one continuation against an evaluator and turns its leaf requests
//! into batches. Each `poll` delivers the predictions for the batch handed
//! out by the previous poll, resumes the continuation until it blocks, and
//! hands out the next batch. Nothing here waits: a poll either returns a
//! batch to predict or reports that the continuation is done.

use gz_core::BaseState;
use gz_features::Transformer;
use gz_infer::{BatchShape, PredictionView};
use gz_mcts::{
    BackendError, Continuation, LeafBackend, Prediction, Progress, PuctEvaluator, SearchError,
    Ticket,
};
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no main loop is active")]
    NoMainLoop,
    #[error("a runnable is already attached to this main loop")]
    RunnableExists,
    #[error("expected {expected} predictions, got {got}")]
    CountMismatch { expected: usize, got: usize },
    #[error("prediction rows do not match the batch shape")]
    ShapeMismatch,
    #[error("continuation blocked with no evaluation requested")]
    Deadlock,
    #[error(transparent)]
    Search(#[from] SearchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    LoopActive,
    AwaitingBatch,
    Done,
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadyEvent<'a> {
    /// Predict `count` states, `channels` holding them back to back.
    Predict { count: usize, channels: &'a [f32] },
    Done,
}

#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub polls: u64,
    pub batches: u64,
    pub predictions: u64,
    pub max_batch_fill: usize,
}

enum Outcome {
    Predict(usize),
    Done,
}

/// Collects leaf requests into the batch under construction and holds
/// delivered predictions until their ticket is asked for.
struct BatchBackend {
    transformer: Box<dyn Transformer>,
    shape: BatchShape,
    batch_size: usize,
    requests: Vec<Ticket>,
    channels: Vec<f32>,
    sent: Vec<f32>,
    in_flight: Vec<Ticket>,
    ready: FxHashMap<Ticket, Prediction>,
    next_ticket: u64,
}

impl BatchBackend {
    fn discard(&mut self) {
        self.requests.clear();
        self.channels.clear();
        self.sent.clear();
        self.in_flight.clear();
        self.ready.clear();
    }

    /// Move the batch under construction to `in_flight`.
    fn seal(&mut self) -> usize {
        std::mem::swap(&mut self.sent, &mut self.channels);
        self.channels.clear();
        self.in_flight = std::mem::take(&mut self.requests);
        self.in_flight.len()
    }

    fn deliver(&mut self, predictions: &PredictionView<'_>) -> Result<(), SchedulerError> {
        if predictions.count() != self.in_flight.len() {
            return Err(SchedulerError::CountMismatch {
                expected: self.in_flight.len(),
                got: predictions.count(),
            });
        }
        let heads = self.shape.head_count();
        if predictions.head_count() != heads
            || predictions.role_count() != self.shape.role_count
            || (predictions.count() > 0
                && (0..heads)
                    .any(|h| predictions.policy_row(h, 0).len() != self.shape.policy_lens[h]))
        {
            return Err(SchedulerError::ShapeMismatch);
        }
        for (row, ticket) in self.in_flight.drain(..).enumerate() {
            let policies = (0..self.shape.head_count())
                .map(|h| predictions.policy_row(h, row).to_vec())
                .collect();
            let values = predictions.values_row(row).to_vec();
            self.ready.insert(ticket, Prediction { policies, values });
        }
        Ok(())
    }
}

impl LeafBackend for BatchBackend {
    fn capacity_left(&self) -> usize {
        self.batch_size.saturating_sub(self.requests.len())
    }

    fn submit(&mut self, state: &BaseState) -> Result<Ticket, BackendError> {
        if self.requests.len() >= self.batch_size {
            return Err(BackendError::Full);
        }
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        let len = self.shape.channel_len;
        let start = self.channels.len();
        self.channels.resize(start + len, 0.0);
        self.transformer.encode_into(state, &mut self.channels[start..]);
        self.requests.push(ticket);
        Ok(ticket)
    }

    fn try_recv(&mut self, ticket: Ticket) -> Result<Option<Prediction>, BackendError> {
        if let Some(p) = self.ready.remove(&ticket) {
            return Ok(Some(p));
        }
        if self.requests.contains(&ticket) || self.in_flight.contains(&ticket) {
            return Ok(None);
        }
        Err(BackendError::UnknownTicket(ticket))
    }
}

pub struct Scheduler<T> {
    batch: BatchBackend,
    task: Option<T>,
    state: SchedulerState,
    stats: SchedulerStats,
}

impl<T: Continuation> Scheduler<T> {
    /// `batch_size` is clamped to at least one.
    pub fn new(transformer: Box<dyn Transformer>, batch_size: usize) -> Self {
        let shape = BatchShape {
            channel_len: transformer.channel_len(),
            policy_lens: (0..transformer.policy_count())
                .map(|h| transformer.policy_len(h))
                .collect(),
            role_count: transformer.role_count(),
        };
        Self {
            batch: BatchBackend {
                transformer,
                shape,
                batch_size: batch_size.max(1),
                requests: Vec::new(),
                channels: Vec::new(),
                sent: Vec::new(),
                in_flight: Vec::new(),
                ready: FxHashMap::default(),
                next_ticket: 1,
            },
            task: None,
            state: SchedulerState::Idle,
            stats: SchedulerStats::default(),
        }
    }

    pub fn shape(&self) -> &BatchShape {
        &self.batch.shape
    }

    pub fn transformer(&self) -> &dyn Transformer {
        self.batch.transformer.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch.batch_size
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn task(&self) -> Option<&T> {
        self.task.as_ref()
    }

    pub fn task_mut(&mut self) -> Option<&mut T> {
        self.task.as_mut()
    }

    pub fn take_task(&mut self) -> Option<T> {
        self.task.take()
    }

    /// Start a fresh main loop, dropping the continuation and every request
    /// or prediction that belonged to the old one.
    pub fn create_main_loop(&mut self) {
        if self.task.is_some() || !self.batch.in_flight.is_empty() {
            tracing::debug!(
                in_flight = self.batch.in_flight.len(),
                "discarding previous main loop"
            );
        }
        self.task = None;
        self.batch.discard();
        self.state = SchedulerState::LoopActive;
    }

    pub fn add_runnable(&mut self, task: T) -> Result<(), SchedulerError> {
        if self.state != SchedulerState::LoopActive {
            return Err(SchedulerError::NoMainLoop);
        }
        if self.task.is_some() {
            return Err(SchedulerError::RunnableExists);
        }
        self.task = Some(task);
        Ok(())
    }

    /// Deliver `predictions` for the batch handed out last time (empty on
    /// the first poll of a main loop) and advance the continuation.
    pub fn poll(
        &mut self,
        ev: &mut PuctEvaluator,
        predictions: &PredictionView<'_>,
    ) -> Result<ReadyEvent<'_>, SchedulerError> {
        self.stats.polls += 1;
        match self.advance(ev, predictions) {
            Ok(Outcome::Predict(count)) => Ok(ReadyEvent::Predict {
                count,
                channels: &self.batch.sent,
            }),
            Ok(Outcome::Done) => Ok(ReadyEvent::Done),
            Err(e) => {
                tracing::error!(error = %e, state = ?self.state, "poll failed");
                self.task = None;
                self.batch.discard();
                self.state = SchedulerState::Idle;
                Err(e)
            }
        }
    }

    fn advance(
        &mut self,
        ev: &mut PuctEvaluator,
        predictions: &PredictionView<'_>,
    ) -> Result<Outcome, SchedulerError> {
        match self.state {
            SchedulerState::AwaitingBatch => {
                self.batch.deliver(predictions)?;
                self.stats.predictions += predictions.count() as u64;
                self.state = SchedulerState::LoopActive;
            }
            SchedulerState::Idle | SchedulerState::LoopActive | SchedulerState::Done => {
                if !predictions.is_empty() {
                    return Err(SchedulerError::CountMismatch {
                        expected: 0,
                        got: predictions.count(),
                    });
                }
                if self.state != SchedulerState::LoopActive {
                    return Ok(Outcome::Done);
                }
            }
        }

        let Some(task) = self.task.as_mut() else {
            self.state = SchedulerState::Done;
            return Ok(Outcome::Done);
        };
        match task.resume(ev, &mut self.batch)? {
            Progress::Done => {
                self.state = SchedulerState::Done;
                Ok(Outcome::Done)
            }
            Progress::Blocked => {
                if self.batch.requests.is_empty() {
                    return Err(SchedulerError::Deadlock);
                }
                let count = self.batch.seal();
                self.stats.batches += 1;
                self.stats.max_batch_fill = self.stats.max_batch_fill.max(count);
                self.state = SchedulerState::AwaitingBatch;
                tracing::trace!(count, "batch ready");
                Ok(Outcome::Predict(count))
            }
        }
    }
}
