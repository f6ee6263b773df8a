//! `flowfarm` worker: claims frame pairs in a shared directory and computes
//! their optical flow. Start one per node; nodes coordinate only through the
//! placeholder files they create.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use flowfarm::backend::build_backend;
use flowfarm::claim::{Claimant, JobClaimer};
use flowfarm::cli::{self, CliOptions};
use flowfarm::config::{self, RunConfig};
use flowfarm::consistency::ConsistencyChecker;
use flowfarm::logging;
use flowfarm::naming;
use flowfarm::pipeline::FlowPipeline;
use flowfarm::pool::{PoolSummary, WorkerPool};

/// Some claimed jobs failed; their placeholders stay behind.
const EXIT_JOB_FAILURES: u8 = 1;
/// The worker could not start or the pool aborted.
const EXIT_FATAL: u8 = 2;

fn main() -> ExitCode {
    if let Err(err) = logging::init() {
        eprintln!("Logging disabled: {err}");
    }
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_JOB_FAILURES),
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("{err}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

/// Returns whether every claimed job succeeded.
fn run() -> Result<bool, String> {
    let Some(options) = cli::parse_args(std::env::args().skip(1).collect())? else {
        return Ok(true);
    };
    let CliOptions {
        overrides,
        config: config_path,
        summary: summary_path,
    } = options;
    let settings = match &config_path {
        Some(path) => config::load_from(path),
        None => config::load_or_default(),
    }
    .map_err(|err| err.to_string())?;
    let run_config = RunConfig::resolve(settings, overrides);
    config::ensure_shared_dir(&run_config).map_err(|err| err.to_string())?;

    let (start, count) = job_range(&run_config)?;
    if count == 0 {
        tracing::warn!(
            "No frame pairs to process in {} starting at job {start}",
            run_config.shared_dir.display()
        );
    }

    let backend = build_backend(run_config.backend, &run_config.tools);
    let checker = ConsistencyChecker::new(&run_config.tools.consistency_checker);
    tracing::info!(
        backend = run_config.backend.label(),
        checker = %checker.program().display(),
        "Pipeline ready"
    );
    let pipeline = FlowPipeline::new(backend, checker);
    let claimer = JobClaimer::new(
        run_config.shared_dir.clone(),
        run_config.naming.clone(),
        Claimant::current(),
    );
    let pool = WorkerPool::new(claimer, Arc::new(pipeline), run_config.max_jobs);
    let summary = pool.run(start, count).map_err(|err| err.to_string())?;

    report(&summary);
    if let Some(path) = &summary_path {
        write_summary(path, &summary)?;
    }
    Ok(summary.all_succeeded())
}

/// First job index and number of jobs to attempt.
fn job_range(run_config: &RunConfig) -> Result<(u32, usize), String> {
    let available = run_config
        .naming
        .count_frames(&run_config.shared_dir)
        .map_err(|err| {
            format!(
                "Failed to list frames in {}: {err}",
                run_config.shared_dir.display()
            )
        })?;
    let frames = run_config.frames_to_process(available);
    let jobs = naming::job_count(frames);
    let start = run_config.start_index;
    let count = (jobs + 1).saturating_sub(start as usize);
    tracing::info!(available, frames, jobs, start, count, "Frames enumerated");
    Ok((start, count))
}

fn report(summary: &PoolSummary) {
    if summary.all_succeeded() {
        tracing::info!(
            "Done: {} claimed, {} skipped, all succeeded",
            summary.claimed,
            summary.skipped
        );
        return;
    }
    let failed = summary
        .failures
        .iter()
        .map(|failure| failure.idx.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    tracing::warn!(
        "Done: {} claimed, {} skipped, {} failed (jobs {failed})",
        summary.claimed,
        summary.skipped,
        summary.failed
    );
}

fn write_summary(path: &Path, summary: &PoolSummary) -> Result<(), String> {
    let payload = serde_json::to_vec_pretty(summary)
        .map_err(|err| format!("Serialize summary failed: {err}"))?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|err| format!("Create summary dir {} failed: {err}", parent.display()))?;
    }
    std::fs::write(path, payload)
        .map_err(|err| format!("Write summary {} failed: {err}", path.display()))
}
