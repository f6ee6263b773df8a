//! Middlebury `.flo` reader and writer.
//!
//! Layout: `f32` magic `202021.25`, `u32` width, `u32` height, then
//! `width * height` interleaved `(dx, dy)` pairs of `f32`, row-major. All
//! values are little-endian. The consistency checker and DeepFlow2 both speak
//! this format, so there is no version field.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayView3};
use thiserror::Error;

/// Magic number opening every `.flo` file.
pub const FLOW_MAGIC: f32 = 202021.25;
/// Size of the magic, width and height fields.
pub const HEADER_LEN: usize = 12;

/// Errors produced while decoding in-memory flow data.
#[derive(Debug, Error, PartialEq)]
pub enum FlowDecodeError {
    #[error("Flow data too short for header ({len} bytes)")]
    MissingHeader { len: usize },
    #[error("Bad flow magic {found}")]
    BadMagic { found: f32 },
    #[error("Flow payload truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Flow dimensions {width}x{height} overflow")]
    Overflow { width: u32, height: u32 },
}

/// Errors produced while reading or writing flow files.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid flow file {path}: {source}")]
    Decode {
        path: PathBuf,
        source: FlowDecodeError,
    },
}

/// Dense per-pixel displacement field, stored as `(height, width, 2)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    data: Array3<f32>,
}

impl FlowField {
    /// Zero-motion field of the given size.
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            data: Array3::zeros((height, width, 2)),
        }
    }

    /// Wrap an existing `(height, width, 2)` array.
    ///
    /// Returns `None` when the last axis is not of length 2.
    pub fn from_array(data: Array3<f32>) -> Option<Self> {
        (data.dim().2 == 2).then_some(Self { data })
    }

    /// Build a field from interleaved row-major `(dx, dy)` values.
    pub fn from_interleaved(width: usize, height: usize, values: Vec<f32>) -> Option<Self> {
        Array3::from_shape_vec((height, width, 2), values)
            .ok()
            .map(|data| Self { data })
    }

    pub fn width(&self) -> usize {
        self.data.dim().1
    }

    pub fn height(&self) -> usize {
        self.data.dim().0
    }

    /// Displacement at pixel `(x, y)`.
    pub fn get(&self, x: usize, y: usize) -> Option<(f32, f32)> {
        let dx = *self.data.get((y, x, 0))?;
        let dy = *self.data.get((y, x, 1))?;
        Some((dx, dy))
    }

    pub fn set(&mut self, x: usize, y: usize, dx: f32, dy: f32) {
        if x < self.width() && y < self.height() {
            self.data[(y, x, 0)] = dx;
            self.data[(y, x, 1)] = dy;
        }
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn into_array(self) -> Array3<f32> {
        self.data
    }
}

/// Serialize a field into `.flo` bytes.
pub fn encode(field: &FlowField) -> Vec<u8> {
    let payload = field.width() * field.height() * 2 * 4;
    let mut out = Vec::with_capacity(HEADER_LEN + payload);
    out.extend_from_slice(&FLOW_MAGIC.to_le_bytes());
    out.extend_from_slice(&(field.width() as u32).to_le_bytes());
    out.extend_from_slice(&(field.height() as u32).to_le_bytes());
    for value in field.data.iter() {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Parse `.flo` bytes. Bytes past the declared payload are ignored.
pub fn decode(bytes: &[u8]) -> Result<FlowField, FlowDecodeError> {
    let (width, height) = decode_header(bytes)?;
    let expected = payload_len(width, height)?;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() < expected {
        return Err(FlowDecodeError::Truncated {
            expected,
            actual: payload.len(),
        });
    }
    let values = payload[..expected]
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<_>>();
    FlowField::from_interleaved(width as usize, height as usize, values).ok_or(
        FlowDecodeError::Overflow { width, height },
    )
}

/// Parse only the header, returning `(width, height)`.
pub fn decode_header(bytes: &[u8]) -> Result<(u32, u32), FlowDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FlowDecodeError::MissingHeader { len: bytes.len() });
    }
    let magic = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != FLOW_MAGIC {
        return Err(FlowDecodeError::BadMagic { found: magic });
    }
    let width = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let height = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    Ok((width, height))
}

fn payload_len(width: u32, height: u32) -> Result<usize, FlowDecodeError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(8))
        .ok_or(FlowDecodeError::Overflow { width, height })
}

/// Write `field` to `path`, replacing any existing file.
pub fn write_flow(path: &Path, field: &FlowField) -> Result<(), CodecError> {
    std::fs::write(path, encode(field)).map_err(|source| CodecError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a complete `.flo` file.
pub fn read_flow(path: &Path) -> Result<FlowField, CodecError> {
    let bytes = std::fs::read(path).map_err(|source| CodecError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    decode(&bytes).map_err(|source| CodecError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// Read only the header of a `.flo` file and check the payload is complete.
pub fn read_dimensions(path: &Path) -> Result<(u32, u32), CodecError> {
    let read_err = |source| CodecError::Read {
        path: path.to_path_buf(),
        source,
    };
    let decode_err = |source| CodecError::Decode {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(read_err)?;
    let file_len = file.metadata().map_err(read_err)?.len() as usize;
    let mut header = Vec::with_capacity(HEADER_LEN);
    file.by_ref()
        .take(HEADER_LEN as u64)
        .read_to_end(&mut header)
        .map_err(read_err)?;
    let (width, height) = decode_header(&header).map_err(decode_err)?;
    let expected = payload_len(width, height).map_err(decode_err)?;
    let actual = file_len.saturating_sub(HEADER_LEN);
    if actual < expected {
        return Err(decode_err(FlowDecodeError::Truncated { expected, actual }));
    }
    Ok((width, height))
}
