//! Per-job processing sequence.
//!
//! For a claimed job `i` the pipeline computes forward (`i -> i+1`) and
//! backward (`i+1 -> i`) flow, runs the consistency check and finally removes
//! the forward field. A failing step leaves everything written so far on disk
//! and fails the job; there is no retry.

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::{BackendError, BackendKind, FlowBackend, FlowRequest};
use crate::claim::ClaimedJob;
use crate::consistency::{ConsistencyChecker, ConsistencyError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Job {idx}: input frame {path} is missing")]
    MissingFrame { idx: u32, path: PathBuf },
    #[error("Job {idx}: flow estimation failed: {source}")]
    Backend { idx: u32, source: BackendError },
    #[error("Job {idx}: consistency check failed: {source}")]
    Consistency { idx: u32, source: ConsistencyError },
    #[error("Failed to remove intermediate {path}: {source}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Job {idx} panicked: {message}")]
    Panicked { idx: u32, message: String },
}

/// Files a successful job leaves in the shared directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArtifacts {
    pub idx: u32,
    pub backward: PathBuf,
    pub reliability: PathBuf,
}

/// Flow backend plus consistency checker, run once per claimed job.
pub struct FlowPipeline {
    backend: Box<dyn FlowBackend>,
    checker: ConsistencyChecker,
}

impl FlowPipeline {
    pub fn new(backend: Box<dyn FlowBackend>, checker: ConsistencyChecker) -> Self {
        Self { backend, checker }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Process one claimed job to completion.
    pub fn run(&self, job: &ClaimedJob) -> Result<JobArtifacts, PipelineError> {
        let idx = job.idx;
        let paths = &job.paths;
        for frame in [&paths.start_frame, &paths.end_frame] {
            if !frame.is_file() {
                return Err(PipelineError::MissingFrame {
                    idx,
                    path: frame.clone(),
                });
            }
        }

        tracing::info!(idx, backend = self.backend.kind().label(), "Computing flow");
        self.backend
            .compute(&FlowRequest {
                start_frame: &paths.start_frame,
                end_frame: &paths.end_frame,
                forward: &paths.forward,
                backward: &paths.backward,
            })
            .map_err(|source| PipelineError::Backend { idx, source })?;

        tracing::debug!(idx, "Checking consistency");
        self.checker
            .check(
                &paths.backward,
                &paths.forward,
                &paths.reliability,
                &paths.end_frame,
            )
            .map_err(|source| PipelineError::Consistency { idx, source })?;

        std::fs::remove_file(&paths.forward).map_err(|source| PipelineError::Cleanup {
            path: paths.forward.clone(),
            source,
        })?;
        tracing::info!(idx, "Job complete");
        Ok(JobArtifacts {
            idx,
            backward: paths.backward.clone(),
            reliability: paths.reliability.clone(),
        })
    }
}
