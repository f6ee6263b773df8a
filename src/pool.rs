//! Bounded per-node worker pool.
//!
//! The coordinator walks job indices in order, claiming each one only when a
//! slot is free, and runs every claimed job on its own thread. Finished jobs
//! report back over a channel, so a full pool sleeps in `recv` until a slot
//! opens. Job failures are collected into a [`PoolSummary`]; only claim
//! failures stop the pool.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use serde::Serialize;
use thiserror::Error;

use crate::claim::{ClaimError, ClaimedJob, JobClaimer};
use crate::pipeline::{FlowPipeline, JobArtifacts, PipelineError};

/// Executes one claimed job. Implemented by [`FlowPipeline`].
pub trait JobRunner: Send + Sync {
    fn run_job(&self, job: &ClaimedJob) -> Result<JobArtifacts, PipelineError>;
}

impl JobRunner for FlowPipeline {
    fn run_job(&self, job: &ClaimedJob) -> Result<JobArtifacts, PipelineError> {
        self.run(job)
    }
}

/// Errors that end the pool early. Running jobs are drained first.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Claiming job {idx} failed: {source}")]
    Claim { idx: u32, source: ClaimError },
    #[error("Shared directory {path} is unusable: {source}")]
    SharedDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to start thread for job {idx}: {source}")]
    Spawn { idx: u32, source: std::io::Error },
}

/// Completion message sent by a job thread.
#[derive(Debug)]
pub struct JobReport {
    pub idx: u32,
    pub outcome: Result<JobArtifacts, PipelineError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub idx: u32,
    pub message: String,
}

/// Tally of one pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    /// Indices a claim was attempted for.
    pub attempted: usize,
    pub claimed: usize,
    /// Already claimed by another worker.
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<JobFailure>,
}

impl PoolSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, report: JobReport) {
        match report.outcome {
            Ok(artifacts) => {
                self.succeeded += 1;
                tracing::debug!(
                    idx = report.idx,
                    "Wrote {} and {}",
                    artifacts.backward.display(),
                    artifacts.reliability.display()
                );
            }
            Err(err) => {
                self.failed += 1;
                tracing::error!(idx = report.idx, "Job failed: {err}");
                self.failures.push(JobFailure {
                    idx: report.idx,
                    message: err.to_string(),
                });
            }
        }
    }
}

/// Claims and runs jobs with at most `max_jobs` in flight.
pub struct WorkerPool {
    claimer: JobClaimer,
    runner: Arc<dyn JobRunner>,
    max_jobs: usize,
}

impl WorkerPool {
    pub fn new(claimer: JobClaimer, runner: Arc<dyn JobRunner>, max_jobs: usize) -> Self {
        Self {
            claimer,
            runner,
            max_jobs: max_jobs.max(1),
        }
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    /// Attempt jobs `start..start + count` and wait for every claimed one.
    pub fn run(&self, start: u32, count: usize) -> Result<PoolSummary, PoolError> {
        self.check_shared_dir()?;
        let (tx, rx) = mpsc::channel::<JobReport>();
        let mut summary = PoolSummary::default();
        let mut in_flight = 0usize;
        let mut handles: Vec<JobHandle> = Vec::new();
        let mut abort = None;

        tracing::info!(
            start,
            count,
            max_jobs = self.max_jobs,
            claimant = %self.claimer.claimant(),
            "Worker pool starting"
        );
        for idx in job_indices(start, count) {
            while in_flight >= self.max_jobs {
                wait_for_report(&rx, &mut summary, &mut in_flight);
            }
            summary.attempted += 1;
            let job = match self.claimer.claim(idx) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(source) => {
                    tracing::error!(idx, "Claim failed, stopping: {source}");
                    abort = Some(PoolError::Claim { idx, source });
                    break;
                }
            };
            summary.claimed += 1;
            match self.spawn_job(job, tx.clone()) {
                Ok(handle) => {
                    in_flight += 1;
                    handles.retain(|handle| !handle.is_finished());
                    handles.push(handle);
                }
                Err(err) => {
                    abort = Some(err);
                    break;
                }
            }
        }
        drop(tx);

        while in_flight > 0 {
            wait_for_report(&rx, &mut summary, &mut in_flight);
        }
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!(
            attempted = summary.attempted,
            claimed = summary.claimed,
            skipped = summary.skipped,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Worker pool finished"
        );
        match abort {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    fn check_shared_dir(&self) -> Result<(), PoolError> {
        let path = self.claimer.shared_dir();
        let shared_dir_err = |source| PoolError::SharedDir {
            path: path.to_path_buf(),
            source,
        };
        let metadata = std::fs::metadata(path).map_err(shared_dir_err)?;
        if !metadata.is_dir() {
            return Err(shared_dir_err(std::io::Error::from(
                std::io::ErrorKind::NotADirectory,
            )));
        }
        Ok(())
    }

    fn spawn_job(&self, job: ClaimedJob, tx: Sender<JobReport>) -> Result<JobHandle, PoolError> {
        let idx = job.idx;
        let runner = Arc::clone(&self.runner);
        std::thread::Builder::new()
            .name(format!("flow-job-{idx}"))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| runner.run_job(&job)))
                    .unwrap_or_else(|payload| {
                        Err(PipelineError::Panicked {
                            idx,
                            message: panic_to_string(payload),
                        })
                    });
                let _ = tx.send(JobReport { idx, outcome });
            })
            .map_err(|source| PoolError::Spawn { idx, source })
    }
}

type JobHandle = JoinHandle<()>;

fn job_indices(start: u32, count: usize) -> impl Iterator<Item = u32> {
    let end = u32::try_from(count)
        .ok()
        .and_then(|count| start.checked_add(count))
        .unwrap_or(u32::MAX);
    start..end
}

/// Block until one running job reports back.
fn wait_for_report(rx: &Receiver<JobReport>, summary: &mut PoolSummary, in_flight: &mut usize) {
    match rx.recv() {
        Ok(report) => {
            summary.record(report);
            *in_flight -= 1;
        }
        Err(_) => {
            // Every sender is gone, so nothing is left running.
            tracing::warn!(in_flight = *in_flight, "Job threads exited without reporting");
            *in_flight = 0;
        }
    }
}

fn panic_to_string(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests;
