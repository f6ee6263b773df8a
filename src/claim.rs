//! Exclusive job claims through the shared directory.
//!
//! A job is claimed by creating its placeholder with create-new semantics.
//! The filesystem guarantees exactly one creator wins, whether the racers are
//! threads in this process or workers on other machines mounting the same
//! directory. Claims are never released, even when the job later fails.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

use crate::naming::{FrameNaming, JobPaths};

/// Unexpected failure while claiming; fatal to the worker.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("Failed to create placeholder {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Job index {idx} has no following frame")]
    IndexOutOfRange { idx: u32 },
}

/// Diagnostic identity written into placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimant {
    pub host: String,
    pub worker: Uuid,
}

impl Claimant {
    /// Identity of this process: hostname plus a fresh worker id.
    pub fn current() -> Self {
        Self {
            host: sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string()),
            worker: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for Claimant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.host, self.worker)
    }
}

/// A job this worker now owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub idx: u32,
    pub paths: JobPaths,
}

impl ClaimedJob {
    pub fn start_frame(&self) -> &Path {
        &self.paths.start_frame
    }

    pub fn end_frame(&self) -> &Path {
        &self.paths.end_frame
    }
}

/// Claims frame-pair jobs in one shared directory.
#[derive(Debug, Clone)]
pub struct JobClaimer {
    shared_dir: PathBuf,
    naming: FrameNaming,
    claimant: Claimant,
}

impl JobClaimer {
    pub fn new(shared_dir: impl Into<PathBuf>, naming: FrameNaming, claimant: Claimant) -> Self {
        Self {
            shared_dir: shared_dir.into(),
            naming,
            claimant,
        }
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    pub fn claimant(&self) -> &Claimant {
        &self.claimant
    }

    /// Try to claim job `idx`.
    ///
    /// `Ok(None)` means another worker already owns the job; callers move on
    /// to the next index and never retry this one.
    pub fn claim(&self, idx: u32) -> Result<Option<ClaimedJob>, ClaimError> {
        self.claim_with(idx, write_marker)
    }

    fn claim_with(
        &self,
        idx: u32,
        mark: impl FnOnce(&mut File, &Claimant) -> std::io::Result<()>,
    ) -> Result<Option<ClaimedJob>, ClaimError> {
        let paths = self
            .naming
            .job_paths(&self.shared_dir, idx)
            .ok_or(ClaimError::IndexOutOfRange { idx })?;
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&paths.placeholder)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                tracing::trace!(idx, "Job already claimed elsewhere");
                return Ok(None);
            }
            Err(source) => {
                return Err(ClaimError::Create {
                    path: paths.placeholder,
                    source,
                });
            }
        };
        // The marker is informational; the claim stands without it.
        if let Err(err) = mark(&mut file, &self.claimant) {
            tracing::warn!(
                idx,
                "Failed to write claimant marker to {}: {err}",
                paths.placeholder.display()
            );
        }
        tracing::debug!(idx, "Job claimed");
        Ok(Some(ClaimedJob { idx, paths }))
    }
}

fn write_marker(file: &mut File, claimant: &Claimant) -> std::io::Result<()> {
    write!(file, "PLACEHOLDER CREATED BY {claimant}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::tempdir;

    fn claimer(dir: &Path) -> JobClaimer {
        JobClaimer::new(dir, FrameNaming::default(), Claimant::current())
    }

    #[test]
    fn first_claim_returns_frame_pair_and_marks_placeholder() {
        let dir = tempdir().unwrap();
        let claimer = claimer(dir.path());
        let job = claimer.claim(3).unwrap().expect("fresh index must be claimable");
        assert_eq!(job.idx, 3);
        assert_eq!(job.start_frame(), dir.path().join("frame_0003.ppm"));
        assert_eq!(job.end_frame(), dir.path().join("frame_0004.ppm"));
        let marker = std::fs::read_to_string(dir.path().join("frame_0003.plc")).unwrap();
        assert!(marker.starts_with("PLACEHOLDER CREATED BY "));
        assert!(marker.contains(&claimer.claimant().worker.to_string()));
    }

    #[test]
    fn repeated_claims_report_no_job() {
        let dir = tempdir().unwrap();
        let first = claimer(dir.path());
        let second = claimer(dir.path());
        assert!(first.claim(1).unwrap().is_some());
        for _ in 0..3 {
            assert!(first.claim(1).unwrap().is_none());
            assert!(second.claim(1).unwrap().is_none());
        }
        let marker = std::fs::read_to_string(dir.path().join("frame_0001.plc")).unwrap();
        assert!(marker.contains(&first.claimant().worker.to_string()));
    }

    #[test]
    fn concurrent_claimants_have_exactly_one_winner() {
        let dir = tempdir().unwrap();
        let contenders = 8;
        for idx in 1..=5u32 {
            let barrier = Arc::new(Barrier::new(contenders));
            let wins = std::thread::scope(|scope| {
                let handles = (0..contenders)
                    .map(|_| {
                        let barrier = Arc::clone(&barrier);
                        let claimer = claimer(dir.path());
                        scope.spawn(move || {
                            barrier.wait();
                            claimer.claim(idx).unwrap().is_some()
                        })
                    })
                    .collect::<Vec<_>>();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap())
                    .filter(|won| *won)
                    .count()
            });
            assert_eq!(wins, 1, "index {idx} claimed {wins} times");
        }
    }

    #[test]
    fn missing_shared_dir_is_claim_error() {
        let dir = tempdir().unwrap();
        let claimer = claimer(&dir.path().join("not-mounted"));
        let err = claimer.claim(1).unwrap_err();
        assert!(matches!(err, ClaimError::Create { .. }));
    }

    #[test]
    fn marker_write_failure_keeps_the_claim() {
        let dir = tempdir().unwrap();
        let claimer = claimer(dir.path());
        let job = claimer
            .claim_with(2, |_, _| Err(std::io::Error::from(ErrorKind::StorageFull)))
            .unwrap()
            .expect("claim must stand without its marker");
        assert_eq!(job.idx, 2);
        let placeholder = dir.path().join("frame_0002.plc");
        assert!(placeholder.is_file());
        assert_eq!(std::fs::read_to_string(&placeholder).unwrap(), "");
        assert!(claimer.claim(2).unwrap().is_none());
    }

    #[test]
    fn last_index_is_rejected_without_a_placeholder() {
        let dir = tempdir().unwrap();
        let claimer = claimer(dir.path());
        let err = claimer.claim(u32::MAX).unwrap_err();
        assert!(matches!(err, ClaimError::IndexOutOfRange { idx: u32::MAX }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
