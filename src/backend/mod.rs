//! Optical-flow estimators.
//!
//! A backend turns a frame pair into forward and backward `.flo` files. The
//! pipeline around it (claim, consistency check, cleanup) does not care how
//! the fields were produced.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ToolPaths;

mod deepflow;
mod farneback;
pub(crate) mod process;
mod raster;

pub use deepflow::DeepFlowBackend;
pub use farneback::{FARNEBACK_PARAMS, FarnebackBackend, FarnebackParams, estimate_flow};

/// Which estimator to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process Farnebäck flow on grayscale frames.
    Fast,
    /// DeepMatching piped into DeepFlow2.
    #[default]
    Accurate,
}

impl BackendKind {
    pub fn from_fast_flag(fast: bool) -> Self {
        if fast { Self::Fast } else { Self::Accurate }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Fast => "farneback",
            Self::Accurate => "deepflow2",
        }
    }
}

/// Input frames and output locations for one job.
#[derive(Debug, Clone, Copy)]
pub struct FlowRequest<'a> {
    pub start_frame: &'a Path,
    pub end_frame: &'a Path,
    /// Destination of the `start -> end` field.
    pub forward: &'a Path,
    /// Destination of the `end -> start` field.
    pub backward: &'a Path,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed waiting for {program}: {source}")]
    Wait {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Exited { program: PathBuf, status: ExitStatus },
    #[error("Failed to decode frame {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("Frame sizes differ: {start:?} vs {end:?}")]
    FrameSizeMismatch { start: (usize, usize), end: (usize, usize) },
    #[error("Polynomial expansion is singular for neighbourhood {poly_n}, sigma {poly_sigma}")]
    SingularExpansion { poly_n: usize, poly_sigma: f32 },
    #[error("Flow estimator thread panicked")]
    EstimatorPanicked,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Produces forward and backward flow files for a frame pair.
pub trait FlowBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn compute(&self, request: &FlowRequest<'_>) -> Result<(), BackendError>;
}

/// Build the backend selected by `kind`.
pub fn build_backend(kind: BackendKind, tools: &ToolPaths) -> Box<dyn FlowBackend> {
    match kind {
        BackendKind::Fast => Box::new(FarnebackBackend::new(FARNEBACK_PARAMS)),
        BackendKind::Accurate => Box::new(DeepFlowBackend::new(
            tools.deepmatching.clone(),
            tools.deepflow2.clone(),
        )),
    }
}
