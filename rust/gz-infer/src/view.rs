//! Validated views over externally supplied prediction buffers.
//!
//! Hosts hand back raw buffers (element type, shape, byte strides, bytes).
//! They are checked once here and turned into typed `&[f32]` rows; nothing
//! past this module sees an unchecked buffer.

use thiserror::Error;

use crate::protocol::BatchResponseV1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F64,
    I32,
    U8,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 => 8,
            DType::U8 => 1,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoundaryError {
    #[error("expected {expected} buffers (policy heads + final values), got {got}")]
    BufferCount { expected: usize, got: usize },
    #[error("buffer {index}: element type {got:?}, expected F32")]
    DType { index: usize, got: DType },
    #[error("buffer {index}: shape {got:?}, expected {expected:?}")]
    Shape {
        index: usize,
        got: [usize; 2],
        expected: [usize; 2],
    },
    #[error("buffer {index}: strides {got:?} are not row-major contiguous")]
    NonContiguous { index: usize, got: [usize; 2] },
    #[error("buffer {index}: {got} bytes, need {need}")]
    Truncated { index: usize, got: usize, need: usize },
    #[error("buffer {index}: data is not aligned for f32")]
    Misaligned { index: usize },
}

/// Raw buffer descriptor as supplied by a host: 2-D, byte strides.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub dtype: DType,
    pub shape: [usize; 2],
    pub strides: [usize; 2],
    pub bytes: &'a [u8],
}

impl<'a> BufferDesc<'a> {
    /// Describe a row-major `rows x cols` f32 slice.
    pub fn from_f32(rows: usize, cols: usize, data: &'a [f32]) -> Self {
        Self {
            dtype: DType::F32,
            shape: [rows, cols],
            strides: [cols * 4, 4],
            bytes: bytemuck::cast_slice(data),
        }
    }

    fn validate(&self, index: usize, expected: [usize; 2]) -> Result<&'a [f32], BoundaryError> {
        if self.dtype != DType::F32 {
            return Err(BoundaryError::DType {
                index,
                got: self.dtype,
            });
        }
        if self.shape != expected {
            return Err(BoundaryError::Shape {
                index,
                got: self.shape,
                expected,
            });
        }
        let [rows, cols] = expected;
        let elem = DType::F32.size();
        // Strides of an axis with extent <= 1 are irrelevant.
        let row_ok = rows <= 1 || self.strides[0] == cols * elem;
        let col_ok = cols <= 1 || self.strides[1] == elem;
        if !(row_ok && col_ok) {
            return Err(BoundaryError::NonContiguous {
                index,
                got: self.strides,
            });
        }
        let need = rows * cols * elem;
        if self.bytes.len() < need {
            return Err(BoundaryError::Truncated {
                index,
                got: self.bytes.len(),
                need,
            });
        }
        let bytes: &'a [u8] = self.bytes;
        bytemuck::try_cast_slice::<u8, f32>(&bytes[..need])
            .map_err(|_| BoundaryError::Misaligned { index })
    }
}

/// Row shapes every batch must have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchShape {
    pub channel_len: usize,
    pub policy_lens: Vec<usize>,
    pub role_count: usize,
}

impl BatchShape {
    pub fn head_count(&self) -> usize {
        self.policy_lens.len()
    }
}

/// Typed, validated view of one batch of predictions.
#[derive(Debug, Clone)]
pub struct PredictionView<'a> {
    count: usize,
    policy_lens: Vec<usize>,
    role_count: usize,
    policies: Vec<&'a [f32]>,
    final_values: &'a [f32],
}

impl<'a> PredictionView<'a> {
    /// The bootstrap input: no predictions.
    pub fn empty(shape: &BatchShape) -> Self {
        let none: &'a [f32] = &[];
        Self {
            count: 0,
            policy_lens: shape.policy_lens.clone(),
            role_count: shape.role_count,
            policies: vec![none; shape.head_count()],
            final_values: none,
        }
    }

    /// Validate `count` rows of every head followed by the final-values buffer.
    pub fn from_buffers(
        shape: &BatchShape,
        count: usize,
        buffers: &[BufferDesc<'a>],
    ) -> Result<Self, BoundaryError> {
        let heads = shape.head_count();
        if buffers.len() != heads + 1 {
            return Err(BoundaryError::BufferCount {
                expected: heads + 1,
                got: buffers.len(),
            });
        }
        let mut policies = Vec::with_capacity(heads);
        for (h, &len) in shape.policy_lens.iter().enumerate() {
            policies.push(buffers[h].validate(h, [count, len])?);
        }
        let final_values = buffers[heads].validate(heads, [count, shape.role_count])?;
        Ok(Self {
            count,
            policy_lens: shape.policy_lens.clone(),
            role_count: shape.role_count,
            policies,
            final_values,
        })
    }

    /// Validate a decoded wire response against the expected shape.
    pub fn from_response(
        shape: &BatchShape,
        resp: &'a BatchResponseV1,
    ) -> Result<Self, BoundaryError> {
        let count = resp.count as usize;
        let mut buffers: Vec<BufferDesc<'a>> = resp
            .policies
            .iter()
            .zip(&resp.policy_lens)
            .map(|(p, &len)| BufferDesc::from_f32(count, len as usize, p))
            .collect();
        buffers.push(BufferDesc::from_f32(
            count,
            resp.role_count as usize,
            &resp.final_values,
        ));
        Self::from_buffers(shape, count, &buffers)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn head_count(&self) -> usize {
        self.policy_lens.len()
    }

    pub fn role_count(&self) -> usize {
        self.role_count
    }

    pub fn policy_row(&self, head: usize, row: usize) -> &'a [f32] {
        let len = self.policy_lens[head];
        let head: &'a [f32] = self.policies[head];
        &head[row * len..(row + 1) * len]
    }

    pub fn values_row(&self, row: usize) -> &'a [f32] {
        let values: &'a [f32] = self.final_values;
        &values[row * self.role_count..(row + 1) * self.role_count]
    }
}

/// Owned batch of predictions, row-major per buffer, in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionBatch {
    pub count: usize,
    pub policies: Vec<Vec<f32>>,
    pub final_values: Vec<f32>,
}

impl PredictionBatch {
    pub fn with_capacity(shape: &BatchShape, count: usize) -> Self {
        Self {
            count: 0,
            policies: shape
                .policy_lens
                .iter()
                .map(|&len| Vec::with_capacity(len * count))
                .collect(),
            final_values: Vec::with_capacity(shape.role_count * count),
        }
    }

    /// Append one row: one policy row per head and one value row.
    pub fn push_row(&mut self, policies: &[&[f32]], values: &[f32]) {
        for (buf, row) in self.policies.iter_mut().zip(policies) {
            buf.extend_from_slice(row);
        }
        self.final_values.extend_from_slice(values);
        self.count += 1;
    }

    pub fn view(&self, shape: &BatchShape) -> Result<PredictionView<'_>, BoundaryError> {
        let mut buffers: Vec<BufferDesc<'_>> = self
            .policies
            .iter()
            .zip(&shape.policy_lens)
            .map(|(p, &len)| BufferDesc::from_f32(self.count, len, p))
            .collect();
        buffers.push(BufferDesc::from_f32(
            self.count,
            shape.role_count,
            &self.final_values,
        ));
        PredictionView::from_buffers(shape, self.count, &buffers)
    }
}
