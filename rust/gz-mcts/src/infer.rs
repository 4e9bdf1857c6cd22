//! Leaf evaluation interfaces.
//!
//! Search never computes predictions itself. It submits a state to a
//! [`LeafBackend`], gets a [`Ticket`] back and later asks whether the
//! prediction for that ticket has arrived. The batching scheduler is the
//! production backend; [`InlineBackend`] evaluates queued states in-process
//! through an [`Inference`] and is what the synchronous tests and benches use.

use gz_core::BaseState;
use gz_features::Transformer;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Routing id for one leaf-evaluation request. Monotonic per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub u64);

/// Network output for one state.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// One probability row per policy head.
    pub policies: Vec<Vec<f32>>,
    /// Final-value estimate per role.
    pub values: Vec<f32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("batch is full")]
    Full,
    #[error("no request outstanding for ticket {0:?}")]
    UnknownTicket(Ticket),
}

pub trait LeafBackend {
    /// Requests that can still join the batch being built.
    fn capacity_left(&self) -> usize;

    fn submit(&mut self, state: &BaseState) -> Result<Ticket, BackendError>;

    /// `Ok(None)` while the request is still waiting on its batch.
    fn try_recv(&mut self, ticket: Ticket) -> Result<Option<Prediction>, BackendError>;
}

/// Synchronous evaluation of one encoded state.
pub trait Inference {
    fn eval(&self, channels: &[f32]) -> Prediction;
}

/// Inference from a closure over the encoded channels.
pub struct FnInference<F>(pub F);

impl<F> Inference for FnInference<F>
where
    F: Fn(&[f32]) -> Prediction,
{
    fn eval(&self, channels: &[f32]) -> Prediction {
        (self.0)(channels)
    }
}

/// Uniform policy on every head plus a fixed value for every role.
pub struct UniformInference {
    pub policy_lens: Vec<usize>,
    pub role_count: usize,
    pub value: f32,
}

impl UniformInference {
    pub fn for_transformer(t: &dyn Transformer, value: f32) -> Self {
        Self {
            policy_lens: (0..t.policy_count()).map(|h| t.policy_len(h)).collect(),
            role_count: t.role_count(),
            value,
        }
    }
}

impl Inference for UniformInference {
    fn eval(&self, _channels: &[f32]) -> Prediction {
        Prediction {
            policies: self
                .policy_lens
                .iter()
                .map(|&len| vec![1.0 / len.max(1) as f32; len])
                .collect(),
            values: vec![self.value; self.role_count],
        }
    }
}

/// Backend that queues up to `batch_size` requests and evaluates them on
/// [`InlineBackend::flush`].
pub struct InlineBackend<'a, I: Inference> {
    transformer: &'a dyn Transformer,
    inference: I,
    batch_size: usize,
    next_ticket: u64,
    queued: Vec<(Ticket, Vec<f32>)>,
    ready: FxHashMap<Ticket, Prediction>,
    batches: u64,
}

impl<'a, I: Inference> InlineBackend<'a, I> {
    pub fn new(transformer: &'a dyn Transformer, inference: I, batch_size: usize) -> Self {
        Self {
            transformer,
            inference,
            batch_size: batch_size.max(1),
            next_ticket: 1,
            queued: Vec::new(),
            ready: FxHashMap::default(),
            batches: 0,
        }
    }

    /// Evaluate every queued request. Returns how many were evaluated.
    pub fn flush(&mut self) -> usize {
        let n = self.queued.len();
        if n > 0 {
            self.batches += 1;
        }
        for (ticket, channels) in self.queued.drain(..) {
            let p = self.inference.eval(&channels);
            self.ready.insert(ticket, p);
        }
        n
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }
}

impl<I: Inference> LeafBackend for InlineBackend<'_, I> {
    fn capacity_left(&self) -> usize {
        self.batch_size - self.queued.len()
    }

    fn submit(&mut self, state: &BaseState) -> Result<Ticket, BackendError> {
        if self.queued.len() >= self.batch_size {
            return Err(BackendError::Full);
        }
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        let mut channels = vec![0.0; self.transformer.channel_len()];
        self.transformer.encode_into(state, &mut channels);
        self.queued.push((ticket, channels));
        Ok(ticket)
    }

    fn try_recv(&mut self, ticket: Ticket) -> Result<Option<Prediction>, BackendError> {
        if let Some(p) = self.ready.remove(&ticket) {
            return Ok(Some(p));
        }
        if self.queued.iter().any(|(t, _)| *t == ticket) {
            return Ok(None);
        }
        Err(BackendError::UnknownTicket(ticket))
    }
}
