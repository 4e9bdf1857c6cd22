//! Length-delimited framing: a u32 little-endian length, then the payload.

use std::io::{self, Read, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },
    #[error("unexpected EOF while reading frame")]
    UnexpectedEof,
}

/// Largest accepted payload (256 MiB); a full batch of large boards stays well below it.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Read one frame into `buf`, reusing its allocation. Returns the payload length.
pub fn read_frame_into<R: Read>(r: &mut R, buf: &mut Vec<u8>) -> Result<usize, FrameError> {
    let mut len_bytes = [0u8; 4];
    exact(r, &mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    buf.clear();
    buf.resize(len, 0);
    exact(r, buf)?;
    Ok(len)
}

pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::new();
    read_frame_into(r, &mut buf)?;
    Ok(buf)
}

fn exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof,
        _ => FrameError::Io(e),
    })
}
