//! Inference host clients.
//!
//! A host turns one batch request into one batch response. `SocketHost`
//! talks protocol v1 over TCP or a Unix domain socket and blocks for the
//! answer; `UniformHost` answers in-process with uniform policies and a
//! fixed value, for tests and benchmarks.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::codec::{decode_response, encode_request_into, DecodeError};
use crate::frame::{read_frame_into, write_frame, FrameError};
use crate::protocol::{BatchRequestV1, BatchResponseV1};
use crate::view::BatchShape;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("bad endpoint '{0}': expected tcp://host:port or unix:///path")]
    BadEndpoint(String),
    #[error("response for batch {got}, expected {expected}")]
    BatchMismatch { expected: u64, got: u64 },
}

/// Anything that can evaluate a batch of encoded states.
pub trait InferenceHost {
    fn predict(&mut self, req: &BatchRequestV1) -> Result<BatchResponseV1, ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, ClientError> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(ClientError::BadEndpoint(s.to_string()));
            }
            Ok(Endpoint::Tcp(addr.to_string()))
        } else if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ClientError::BadEndpoint(s.to_string()));
            }
            Ok(Endpoint::Unix(PathBuf::from(path)))
        } else {
            Err(ClientError::BadEndpoint(s.to_string()))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostStats {
    pub batches: u64,
    pub states: u64,
    pub errors: u64,
    pub total_us: u64,
    pub max_us: u64,
}

impl HostStats {
    fn on_batch(&mut self, states: u32, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.batches += 1;
        self.states += states as u64;
        self.total_us += us;
        self.max_us = self.max_us.max(us);
    }

    pub fn mean_us(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.total_us as f64 / self.batches as f64
        }
    }
}

enum Stream {
    Tcp(TcpStream),
    Uds(UnixStream),
}

impl Stream {
    fn set_read_timeout(&self, t: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(t),
            Stream::Uds(s) => s.set_read_timeout(t),
        }
    }

    fn shutdown(&self) {
        match self {
            Stream::Tcp(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            Stream::Uds(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Uds(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Uds(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Uds(s) => s.flush(),
        }
    }
}

/// Blocking protocol v1 client: one batch in flight at a time.
pub struct SocketHost {
    stream: Stream,
    next_batch_id: u64,
    out_buf: Vec<u8>,
    in_buf: Vec<u8>,
    stats: HostStats,
}

impl SocketHost {
    /// Connect; `timeout` bounds each response read.
    pub fn connect(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<Self, ClientError> {
        let stream = match endpoint {
            Endpoint::Tcp(addr) => {
                let s = TcpStream::connect(addr.as_str())?;
                s.set_nodelay(true).ok();
                Stream::Tcp(s)
            }
            Endpoint::Unix(path) => Stream::Uds(UnixStream::connect(path)?),
        };
        stream.set_read_timeout(timeout)?;
        tracing::debug!(?endpoint, "connected to inference host");
        Ok(Self {
            stream,
            next_batch_id: 1,
            out_buf: Vec::with_capacity(4096),
            in_buf: Vec::with_capacity(4096),
            stats: HostStats::default(),
        })
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    fn round_trip(&mut self, req: &BatchRequestV1, batch_id: u64) -> Result<BatchResponseV1, ClientError> {
        let mut sent = req.clone();
        sent.batch_id = batch_id;
        encode_request_into(&mut self.out_buf, &sent);
        write_frame(&mut self.stream, &self.out_buf)?;
        read_frame_into(&mut self.stream, &mut self.in_buf)?;
        let resp = decode_response(&self.in_buf)?;
        if resp.batch_id != batch_id {
            return Err(ClientError::BatchMismatch {
                expected: batch_id,
                got: resp.batch_id,
            });
        }
        Ok(resp)
    }
}

impl InferenceHost for SocketHost {
    /// Sends `req` under a fresh batch id; the caller's `batch_id` is ignored.
    fn predict(&mut self, req: &BatchRequestV1) -> Result<BatchResponseV1, ClientError> {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let t0 = Instant::now();
        match self.round_trip(req, batch_id) {
            Ok(resp) => {
                self.stats.on_batch(req.count, t0.elapsed());
                Ok(resp)
            }
            Err(e) => {
                self.stats.errors += 1;
                tracing::warn!(batch_id, error = %e, "inference round trip failed");
                Err(e)
            }
        }
    }
}

impl Drop for SocketHost {
    fn drop(&mut self) {
        self.stream.shutdown();
    }
}

/// In-process host: uniform policy rows and a constant value for every role.
#[derive(Debug, Clone)]
pub struct UniformHost {
    shape: BatchShape,
    value: f32,
    stats: HostStats,
}

impl UniformHost {
    pub fn new(shape: BatchShape, value: f32) -> Self {
        Self {
            shape,
            value,
            stats: HostStats::default(),
        }
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }
}

impl InferenceHost for UniformHost {
    fn predict(&mut self, req: &BatchRequestV1) -> Result<BatchResponseV1, ClientError> {
        let t0 = Instant::now();
        let n = req.count as usize;
        let expected = n * self.shape.channel_len;
        if req.channels.len() != expected {
            return Err(DecodeError::BadLen {
                what: "channels",
                got: req.channels.len() as u64,
                expected: expected as u64,
            }
            .into());
        }
        let policies = self
            .shape
            .policy_lens
            .iter()
            .map(|&len| vec![1.0 / len.max(1) as f32; n * len])
            .collect();
        let resp = BatchResponseV1 {
            batch_id: req.batch_id,
            count: req.count,
            role_count: self.shape.role_count as u32,
            policy_lens: self.shape.policy_lens.iter().map(|&l| l as u32).collect(),
            policies,
            final_values: vec![self.value; n * self.shape.role_count],
        };
        self.stats.on_batch(req.count, t0.elapsed());
        Ok(resp)
    }
}
