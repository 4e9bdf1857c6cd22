//! Batch protocol v1 between a ggz worker and an out-of-process inference host.
//!
//! One request carries `count` encoded states back to back; the response
//! carries, per policy head, `count` rows of probabilities and `count` rows
//! of per-role final values, all in request order.

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequestV1 {
    /// Assigned by the client; echoed back in the response.
    pub batch_id: u64,
    pub feature_schema_id: u32,
    pub channel_len: u32,
    pub count: u32,
    /// `count * channel_len` floats.
    pub channels: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResponseV1 {
    pub batch_id: u64,
    pub count: u32,
    pub role_count: u32,
    /// Row length of every policy head.
    pub policy_lens: Vec<u32>,
    /// One buffer per head, `count * policy_lens[h]` floats each.
    pub policies: Vec<Vec<f32>>,
    /// `count * role_count` floats.
    pub final_values: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Request = 1,
    Response = 2,
}
