//! gz-infer: the boundary between the search core and an inference host.
//!
//! - [`view`]: validates raw prediction buffers into typed rows.
//! - [`protocol`], [`codec`], [`frame`]: batch messages on the wire.
//! - [`client`]: hosts that answer batches (socket or in-process).

pub mod client;
pub mod codec;
pub mod frame;
pub mod protocol;
pub mod view;

pub use client::{ClientError, Endpoint, HostStats, InferenceHost, SocketHost, UniformHost};
pub use view::{BatchShape, BoundaryError, BufferDesc, DType, PredictionBatch, PredictionView};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
