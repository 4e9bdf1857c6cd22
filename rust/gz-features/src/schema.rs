//! Channel layout for the bases encoding.
//!
//! ### Layout
//! - **bases**: one float per base proposition, 1.0 if true else 0.0, in base
//!   index order.
//! - **padding**: zeros up to the next multiple of [`CHANNEL_ALIGN`].
//!
//! A batch buffer is `count * channel_len` floats, states back to back.

/// Increment this whenever the channel layout changes.
pub const FEATURE_SCHEMA_ID: u32 = 1;

/// Channel buffers are padded to a multiple of this many floats.
pub const CHANNEL_ALIGN: usize = 8;

/// How policy heads map onto roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyHeads {
    /// One head sized to the largest move table, shared by every role.
    Shared,
    /// One head per role, each sized to that role's move table.
    PerRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    pub base_count: usize,
    pub channel_len: usize,
}

impl ChannelLayout {
    pub fn new(base_count: usize) -> Self {
        let channel_len = base_count.div_ceil(CHANNEL_ALIGN).max(1) * CHANNEL_ALIGN;
        Self {
            base_count,
            channel_len,
        }
    }

    pub fn padding(&self) -> usize {
        self.channel_len - self.base_count
    }
}
