//! State to channel encoding.

use gz_core::{BaseState, StateMachine};

use crate::schema::{ChannelLayout, PolicyHeads};

/// Maps game states to network input and describes the network's policy heads.
pub trait Transformer: Send {
    /// Floats per encoded state.
    fn channel_len(&self) -> usize;

    /// Write one state into `out` (`out.len() == channel_len()`).
    fn encode_into(&self, state: &BaseState, out: &mut [f32]);

    /// Number of distinct policy heads the network produces.
    fn policy_count(&self) -> usize;

    /// Row length of policy head `head`.
    fn policy_len(&self, head: usize) -> usize;

    fn role_count(&self) -> usize;
}

/// Encodes the raw base propositions of a state.
#[derive(Debug, Clone)]
pub struct BasesTransformer {
    layout: ChannelLayout,
    heads: PolicyHeads,
    move_counts: Vec<usize>,
}

impl BasesTransformer {
    pub fn for_game(sm: &dyn StateMachine, heads: PolicyHeads) -> Self {
        Self {
            layout: ChannelLayout::new(sm.base_count()),
            heads,
            move_counts: (0..sm.role_count()).map(|r| sm.move_count(r)).collect(),
        }
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn heads(&self) -> PolicyHeads {
        self.heads
    }
}

impl Transformer for BasesTransformer {
    fn channel_len(&self) -> usize {
        self.layout.channel_len
    }

    fn encode_into(&self, state: &BaseState, out: &mut [f32]) {
        assert_eq!(out.len(), self.layout.channel_len, "channel buffer size");
        debug_assert_eq!(state.len(), self.layout.base_count);
        out.fill(0.0);
        for i in state.ones() {
            out[i] = 1.0;
        }
    }

    fn policy_count(&self) -> usize {
        match self.heads {
            PolicyHeads::Shared => 1,
            PolicyHeads::PerRole => self.move_counts.len(),
        }
    }

    fn policy_len(&self, head: usize) -> usize {
        match self.heads {
            PolicyHeads::Shared => self.move_counts.iter().copied().max().unwrap_or(0),
            PolicyHeads::PerRole => self.move_counts[head],
        }
    }

    fn role_count(&self) -> usize {
        self.move_counts.len()
    }
}

/// Encode a batch of states back to back.
pub fn encode_batch<'a, I>(t: &dyn Transformer, states: I) -> Vec<f32>
where
    I: IntoIterator<Item = &'a BaseState>,
{
    let len = t.channel_len();
    let mut out = Vec::new();
    for s in states {
        let start = out.len();
        out.resize(start + len, 0.0);
        t.encode_into(s, &mut out[start..]);
    }
    out
}
