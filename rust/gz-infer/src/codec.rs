//! Binary codec for protocol v1 (payload inside a length-delimited frame).
//!
//! All integers and floats are little-endian. Header: u32 version, u8 kind,
//! u8 flags, u16 reserved, u64 batch_id.

use thiserror::Error;

use crate::protocol::{BatchRequestV1, BatchResponseV1, MsgKind, PROTOCOL_VERSION};

/// Upper bound on policy heads in one response.
pub const MAX_HEADS: u32 = 64;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload too short")]
    TooShort,
    #[error("unsupported protocol version: {0}")]
    BadVersion(u32),
    #[error("unexpected message kind: {0}")]
    BadKind(u8),
    #[error("invalid vector length for {what}: got {got}, expected {expected}")]
    BadLen {
        what: &'static str,
        got: u64,
        expected: u64,
    },
    #[error("too many policy heads: {0}")]
    TooManyHeads(u32),
    #[error("{0} trailing bytes after message")]
    Trailing(usize),
}

fn push_header(out: &mut Vec<u8>, kind: MsgKind, batch_id: u64) {
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    out.push(kind as u8);
    out.push(0); // flags
    out.extend_from_slice(&[0, 0]); // reserved
    out.extend_from_slice(&batch_id.to_le_bytes());
}

fn push_f32s(out: &mut Vec<u8>, values: &[f32]) {
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for &f in values {
        out.extend_from_slice(&f.to_le_bytes());
    }
}

pub fn encode_request_len(req: &BatchRequestV1) -> usize {
    // header 16 + schema/channel_len/count 12 + vec len 4
    32 + req.channels.len() * 4
}

pub fn encode_request_into(out: &mut Vec<u8>, req: &BatchRequestV1) {
    out.clear();
    out.reserve(encode_request_len(req));
    push_header(out, MsgKind::Request, req.batch_id);
    out.extend_from_slice(&req.feature_schema_id.to_le_bytes());
    out.extend_from_slice(&req.channel_len.to_le_bytes());
    out.extend_from_slice(&req.count.to_le_bytes());
    push_f32s(out, &req.channels);
}

pub fn encode_request(req: &BatchRequestV1) -> Vec<u8> {
    let mut out = Vec::new();
    encode_request_into(&mut out, req);
    out
}

pub fn decode_request(bytes: &[u8]) -> Result<BatchRequestV1, DecodeError> {
    let mut c = Cursor::new(bytes);
    let batch_id = c.read_header(MsgKind::Request)?;
    let feature_schema_id = c.read_u32()?;
    let channel_len = c.read_u32()?;
    let count = c.read_u32()?;
    let channels = c.read_f32s("channels", channel_len as u64 * count as u64)?;
    c.finish()?;
    Ok(BatchRequestV1 {
        batch_id,
        feature_schema_id,
        channel_len,
        count,
        channels,
    })
}

pub fn encode_response(resp: &BatchResponseV1) -> Vec<u8> {
    let floats: usize = resp.policies.iter().map(Vec::len).sum::<usize>() + resp.final_values.len();
    let mut out = Vec::with_capacity(32 + resp.policy_lens.len() * 8 + floats * 4);
    push_header(&mut out, MsgKind::Response, resp.batch_id);
    out.extend_from_slice(&resp.count.to_le_bytes());
    out.extend_from_slice(&resp.role_count.to_le_bytes());
    out.extend_from_slice(&(resp.policy_lens.len() as u32).to_le_bytes());
    for &len in &resp.policy_lens {
        out.extend_from_slice(&len.to_le_bytes());
    }
    for head in &resp.policies {
        push_f32s(&mut out, head);
    }
    push_f32s(&mut out, &resp.final_values);
    out
}

pub fn decode_response(bytes: &[u8]) -> Result<BatchResponseV1, DecodeError> {
    let mut c = Cursor::new(bytes);
    let batch_id = c.read_header(MsgKind::Response)?;
    let count = c.read_u32()?;
    let role_count = c.read_u32()?;
    let heads = c.read_u32()?;
    if heads > MAX_HEADS {
        return Err(DecodeError::TooManyHeads(heads));
    }
    let mut policy_lens = Vec::with_capacity(heads as usize);
    for _ in 0..heads {
        policy_lens.push(c.read_u32()?);
    }
    let mut policies = Vec::with_capacity(heads as usize);
    for &len in &policy_lens {
        policies.push(c.read_f32s("policy", len as u64 * count as u64)?);
    }
    let final_values = c.read_f32s("final_values", role_count as u64 * count as u64)?;
    c.finish()?;
    Ok(BatchResponseV1 {
        batch_id,
        count,
        role_count,
        policy_lens,
        policies,
        final_values,
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.bytes.len() - self.off {
            return Err(DecodeError::TooShort);
        }
        let s = &self.bytes[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_header(&mut self, expect: MsgKind) -> Result<u64, DecodeError> {
        let version = self.read_u32()?;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::BadVersion(version));
        }
        let kind = self.read_u8()?;
        if kind != expect as u8 {
            return Err(DecodeError::BadKind(kind));
        }
        let _flags = self.read_u8()?;
        self.take(2)?;
        self.read_u64()
    }

    fn read_f32s(&mut self, what: &'static str, expected: u64) -> Result<Vec<f32>, DecodeError> {
        let len = self.read_u32()? as u64;
        if len != expected {
            return Err(DecodeError::BadLen {
                what,
                got: len,
                expected,
            });
        }
        let raw = self.take(len as usize * 4)?;
        Ok(raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.bytes.len() - self.off {
            0 => Ok(()),
            n => Err(DecodeError::Trailing(n)),
        }
    }
}
