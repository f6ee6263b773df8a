use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::naming::FrameNaming;

/// Upper bound for concurrently running pipelines per worker.
pub const MAX_JOBS_LIMIT: usize = 64;
/// Environment override for `max_jobs`.
pub const MAX_JOBS_ENV: &str = "FLOWFARM_MAX_JOBS";

/// Settings persisted in `flowfarm.toml`.
///
/// Config keys: `max_jobs`, `test_frame_count`, `fast`, `tools`, `naming`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /// Frames considered when running with `--test`.
    #[serde(default = "default_test_frame_count")]
    pub test_frame_count: usize,
    #[serde(default)]
    pub fast: bool,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub naming: FrameNaming,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            test_frame_count: default_test_frame_count(),
            fast: false,
            tools: ToolPaths::default(),
            naming: FrameNaming::default(),
        }
    }
}

impl Settings {
    pub(crate) fn normalized(mut self) -> Self {
        self.max_jobs = clamp_max_jobs(self.max_jobs);
        self.test_frame_count = self.test_frame_count.max(2);
        self
    }
}

/// External executables. Relative paths resolve next to the `flowfarm`
/// binary first.
///
/// Config keys: `deepmatching`, `deepflow2`, `consistency_checker`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    #[serde(default = "default_deepmatching")]
    pub deepmatching: PathBuf,
    #[serde(default = "default_deepflow2")]
    pub deepflow2: PathBuf,
    #[serde(default = "default_consistency_checker")]
    pub consistency_checker: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            deepmatching: default_deepmatching(),
            deepflow2: default_deepflow2(),
            consistency_checker: default_consistency_checker(),
        }
    }
}

/// Command-line values layered over [`Settings`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOverrides {
    pub shared_dir: PathBuf,
    pub test: bool,
    pub fast: bool,
    pub max_jobs: Option<usize>,
    pub start_index: Option<u32>,
}

/// Fully resolved configuration consumed by the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub shared_dir: PathBuf,
    /// Cap on the number of frames considered, set in test mode.
    pub frame_limit: Option<usize>,
    pub backend: BackendKind,
    pub max_jobs: usize,
    /// First job index; jobs are 1-based.
    pub start_index: u32,
    pub tools: ToolPaths,
    pub naming: FrameNaming,
}

impl RunConfig {
    /// Layer CLI overrides and the environment over file settings.
    pub fn resolve(settings: Settings, overrides: RunOverrides) -> Self {
        let settings = settings.normalized();
        let max_jobs = overrides
            .max_jobs
            .filter(|count| *count >= 1)
            .or_else(max_jobs_from_env)
            .map(clamp_max_jobs)
            .unwrap_or(settings.max_jobs);
        Self {
            shared_dir: overrides.shared_dir,
            frame_limit: overrides.test.then_some(settings.test_frame_count),
            backend: BackendKind::from_fast_flag(overrides.fast || settings.fast),
            max_jobs,
            start_index: overrides.start_index.unwrap_or(1).max(1),
            tools: settings.tools,
            naming: settings.naming,
        }
    }

    /// Frames to schedule given `available` frames on disk.
    pub fn frames_to_process(&self, available: usize) -> usize {
        match self.frame_limit {
            Some(limit) => available.min(limit),
            None => available,
        }
    }
}

fn max_jobs_from_env() -> Option<usize> {
    std::env::var(MAX_JOBS_ENV)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|count| *count >= 1)
}

pub(crate) fn clamp_max_jobs(value: usize) -> usize {
    value.clamp(1, MAX_JOBS_LIMIT)
}

fn default_max_jobs() -> usize {
    4
}

fn default_test_frame_count() -> usize {
    10
}

fn default_deepmatching() -> PathBuf {
    PathBuf::from("deepmatching-static")
}

fn default_deepflow2() -> PathBuf {
    PathBuf::from("deepflow2-static")
}

fn default_consistency_checker() -> PathBuf {
    PathBuf::from("consistencyChecker")
}
