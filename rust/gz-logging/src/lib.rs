//! gz-logging: append-only NDJSON run events and the run manifest.
//!
//! Diagnostics go through `tracing`; this crate only covers what a run
//! leaves on disk for post-mortems and training pipelines.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run manifest schema version.
pub const RUN_MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifestV1 {
    pub run_manifest_version: u32,

    pub run_id: String,
    pub created_ts_ms: u64,

    pub protocol_version: u32,
    pub feature_schema_id: u32,
    pub game: String,

    pub git_hash: Option<String>,
    pub config_hash: Option<String>,

    pub logs_dir: String,
    pub inference_endpoint: String,
    pub seed: u64,

    pub games_requested: u64,
    pub selfplay_games_completed: u64,
    pub samples_recorded: u64,
    pub finished_ts_ms: Option<u64>,
}

pub fn now_ms() -> u64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    d.as_millis() as u64
}

pub fn hash_config_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub fn try_git_hash() -> Option<String> {
    use std::process::Command;

    let out = Command::new("git").args(["rev-parse", "HEAD"]).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8(out.stdout).ok()?;
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

pub fn read_manifest(path: impl AsRef<Path>) -> Result<RunManifestV1, NdjsonError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice::<RunManifestV1>(&bytes)?)
}

/// Write through a temporary file and rename, so readers never see a
/// partial manifest.
pub fn write_manifest_atomic(path: impl AsRef<Path>, m: &RunManifestV1) -> Result<(), NdjsonError> {
    let path = path.as_ref();
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(m)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfoV1 {
    pub protocol_version: u32,
    pub feature_schema_id: u32,
    pub game: String,
}

/// One chosen move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveEventV1 {
    pub event: String,
    pub ts_ms: u64,
    pub v: VersionInfoV1,

    pub run_id: String,
    pub game_id: u64,
    pub game_depth: u32,

    pub lead_role: u32,
    pub lead_move: u32,
    pub move_name: String,
    /// A training sample was recorded at this ply.
    pub sampled: bool,
}

/// One finished self-play game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfPlayGameEventV1 {
    pub event: String,
    pub ts_ms: u64,
    pub v: VersionInfoV1,

    pub run_id: String,
    pub game_id: u64,
    pub seed: u64,

    pub game_depth: u32,
    /// "terminal" | "resigned" | "early_loss" | "repetition_draw" | "aborted"
    pub end: String,
    pub scores: Vec<f32>,
    pub samples: u32,
    pub run_to_end: bool,

    pub batches: u64,
    pub predictions: u64,
    pub max_batch_fill: u64,
    pub collisions: u64,
    pub prior_fallbacks: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum NdjsonError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Append-only NDJSON writer.
///
/// Contract: each call writes exactly one JSON object followed by a newline.
pub struct NdjsonWriter {
    w: BufWriter<File>,
    lines_since_flush: u64,
    flush_every_lines: u64,
}

impl NdjsonWriter {
    /// Open a file for append. Creates it if it doesn't exist.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self, NdjsonError> {
        Self::open_append_with_flush(path, 0)
    }

    /// `flush_every_lines=0` disables periodic flushing.
    pub fn open_append_with_flush(
        path: impl AsRef<Path>,
        flush_every_lines: u64,
    ) -> Result<Self, NdjsonError> {
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            w: BufWriter::new(f),
            lines_since_flush: 0,
            flush_every_lines,
        })
    }

    pub fn write_event<T: Serialize>(&mut self, event: &T) -> Result<(), NdjsonError> {
        let mut buf = serde_json::to_vec(event)?;
        buf.push(b'\n');
        self.w.write_all(&buf)?;
        self.lines_since_flush += 1;
        if self.flush_every_lines > 0 && self.lines_since_flush >= self.flush_every_lines {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), NdjsonError> {
        self.w.flush()?;
        self.lines_since_flush = 0;
        Ok(())
    }
}
