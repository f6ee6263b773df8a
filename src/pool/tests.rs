use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::tempdir;
use uuid::Uuid;

use super::*;
use crate::claim::Claimant;
use crate::naming::FrameNaming;

/// Records which jobs ran and how many ran at once.
#[derive(Default)]
struct CountingRunner {
    running: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<u32>>,
    fail: HashSet<u32>,
    panic: HashSet<u32>,
}

impl CountingRunner {
    fn failing(fail: &[u32], panic: &[u32]) -> Self {
        Self {
            fail: fail.iter().copied().collect(),
            panic: panic.iter().copied().collect(),
            ..Self::default()
        }
    }

    fn seen(&self) -> Vec<u32> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort_unstable();
        seen
    }
}

impl JobRunner for CountingRunner {
    fn run_job(&self, job: &ClaimedJob) -> Result<JobArtifacts, PipelineError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.seen.lock().unwrap().push(job.idx);
        std::thread::sleep(Duration::from_millis(15));
        self.running.fetch_sub(1, Ordering::SeqCst);
        if self.panic.contains(&job.idx) {
            panic!("runner exploded on {}", job.idx);
        }
        if self.fail.contains(&job.idx) {
            return Err(PipelineError::MissingFrame {
                idx: job.idx,
                path: job.paths.end_frame.clone(),
            });
        }
        Ok(JobArtifacts {
            idx: job.idx,
            backward: job.paths.backward.clone(),
            reliability: job.paths.reliability.clone(),
        })
    }
}

fn claimer(dir: &Path, naming: FrameNaming) -> JobClaimer {
    JobClaimer::new(
        dir,
        naming,
        Claimant {
            host: "test-node".to_string(),
            worker: Uuid::nil(),
        },
    )
}

#[test]
fn never_exceeds_max_jobs() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(CountingRunner::default());
    let pool = WorkerPool::new(claimer(dir.path(), FrameNaming::default()), runner.clone(), 3);
    let summary = pool.run(1, 12).unwrap();
    assert_eq!(summary.attempted, 12);
    assert_eq!(summary.claimed, 12);
    assert_eq!(summary.succeeded, 12);
    assert!(summary.all_succeeded());
    let peak = runner.peak.load(Ordering::SeqCst);
    assert!(peak > 1, "jobs never overlapped");
    assert!(peak <= 3, "peak {peak} exceeds max_jobs");
    assert_eq!(runner.running.load(Ordering::SeqCst), 0);
    assert_eq!(runner.seen(), (1..=12).collect::<Vec<_>>());
    for idx in 1..=12 {
        assert!(FrameNaming::default().placeholder_path(dir.path(), idx).is_file());
    }
}

#[test]
fn zero_max_jobs_still_runs_one_at_a_time() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(CountingRunner::default());
    let pool = WorkerPool::new(claimer(dir.path(), FrameNaming::default()), runner.clone(), 0);
    assert_eq!(pool.max_jobs(), 1);
    let summary = pool.run(1, 3).unwrap();
    assert_eq!(summary.succeeded, 3);
    assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
}

#[test]
fn skips_jobs_claimed_elsewhere() {
    let dir = tempdir().unwrap();
    let naming = FrameNaming::default();
    std::fs::write(naming.placeholder_path(dir.path(), 2), "other node").unwrap();
    let runner = Arc::new(CountingRunner::default());
    let pool = WorkerPool::new(claimer(dir.path(), naming.clone()), runner.clone(), 2);
    let summary = pool.run(1, 3).unwrap();
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.claimed, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(runner.seen(), vec![1, 3]);
    let marker = std::fs::read_to_string(naming.placeholder_path(dir.path(), 2)).unwrap();
    assert_eq!(marker, "other node");
}

#[test]
fn start_index_offsets_the_range() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(CountingRunner::default());
    let pool = WorkerPool::new(claimer(dir.path(), FrameNaming::default()), runner.clone(), 4);
    let summary = pool.run(5, 2).unwrap();
    assert_eq!(summary.claimed, 2);
    assert_eq!(runner.seen(), vec![5, 6]);
}

#[test]
fn failures_and_panics_do_not_stop_other_jobs() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(CountingRunner::failing(&[2], &[4]));
    let pool = WorkerPool::new(claimer(dir.path(), FrameNaming::default()), runner.clone(), 2);
    let summary = pool.run(1, 5).unwrap();
    assert_eq!(summary.claimed, 5);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 2);
    assert!(!summary.all_succeeded());
    let mut failed = summary.failures.iter().map(|f| f.idx).collect::<Vec<_>>();
    failed.sort_unstable();
    assert_eq!(failed, vec![2, 4]);
    let panicked = summary.failures.iter().find(|f| f.idx == 4).unwrap();
    assert!(panicked.message.contains("runner exploded on 4"));
    // Failed jobs stay claimed.
    assert!(FrameNaming::default().placeholder_path(dir.path(), 2).is_file());
}

#[test]
fn claim_error_aborts_without_running_jobs() {
    let dir = tempdir().unwrap();
    let naming = FrameNaming {
        frame_prefix: "missing/frame_".to_string(),
        ..FrameNaming::default()
    };
    let runner = Arc::new(CountingRunner::default());
    let pool = WorkerPool::new(claimer(dir.path(), naming), runner.clone(), 2);
    let err = pool.run(1, 3).unwrap_err();
    assert!(matches!(err, PoolError::Claim { idx: 1, .. }));
    assert!(runner.seen().is_empty());
}

#[test]
fn missing_shared_dir_is_rejected_up_front() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(CountingRunner::default());
    let pool = WorkerPool::new(
        claimer(&dir.path().join("absent"), FrameNaming::default()),
        runner,
        2,
    );
    assert!(matches!(pool.run(1, 1), Err(PoolError::SharedDir { .. })));
}

#[test]
fn summary_serializes_to_json() {
    let summary = PoolSummary {
        attempted: 3,
        claimed: 2,
        skipped: 1,
        succeeded: 1,
        failed: 1,
        failures: vec![JobFailure {
            idx: 2,
            message: "boom".to_string(),
        }],
    };
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["skipped"], 1);
    assert_eq!(json["failures"][0]["idx"], 2);
    assert_eq!(json["failures"][0]["message"], "boom");
}
