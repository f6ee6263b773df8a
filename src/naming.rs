//! Deterministic file names inside the shared directory.
//!
//! Every cooperating worker must derive the same names from the same job
//! index, otherwise two nodes would claim the same frame pair through
//! different placeholders.

use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Extension of the claim marker files.
pub const PLACEHOLDER_EXTENSION: &str = "plc";

/// How frames are numbered on disk, e.g. `frame_0001.ppm`.
///
/// Config keys: `frame_prefix`, `frame_digits`, `frame_extension`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameNaming {
    #[serde(default = "default_prefix")]
    pub frame_prefix: String,
    #[serde(default = "default_digits")]
    pub frame_digits: usize,
    #[serde(default = "default_extension")]
    pub frame_extension: String,
}

impl Default for FrameNaming {
    fn default() -> Self {
        Self {
            frame_prefix: default_prefix(),
            frame_digits: default_digits(),
            frame_extension: default_extension(),
        }
    }
}

fn default_prefix() -> String {
    "frame_".to_string()
}

fn default_digits() -> usize {
    4
}

fn default_extension() -> String {
    "ppm".to_string()
}

/// All paths touched by one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub placeholder: PathBuf,
    pub start_frame: PathBuf,
    pub end_frame: PathBuf,
    pub forward: PathBuf,
    pub backward: PathBuf,
    pub reliability: PathBuf,
}

impl FrameNaming {
    /// File stem of frame `idx`, without extension.
    pub fn frame_stem(&self, idx: u32) -> String {
        format!(
            "{}{:0width$}",
            self.frame_prefix,
            idx,
            width = self.frame_digits
        )
    }

    pub fn frame_path(&self, dir: &Path, idx: u32) -> PathBuf {
        dir.join(format!("{}.{}", self.frame_stem(idx), self.frame_extension))
    }

    /// Claim marker for job `idx`; named after the job's start frame.
    pub fn placeholder_path(&self, dir: &Path, idx: u32) -> PathBuf {
        dir.join(format!("{}.{PLACEHOLDER_EXTENSION}", self.frame_stem(idx)))
    }

    /// Paths of job `idx`. `None` for `u32::MAX`, which has no end frame.
    pub fn job_paths(&self, dir: &Path, idx: u32) -> Option<JobPaths> {
        let next = idx.checked_add(1)?;
        Some(JobPaths {
            placeholder: self.placeholder_path(dir, idx),
            start_frame: self.frame_path(dir, idx),
            end_frame: self.frame_path(dir, next),
            forward: dir.join(format!("forward_{idx}_{next}.flo")),
            backward: dir.join(format!("backward_{next}_{idx}.flo")),
            reliability: dir.join(format!("reliable_{next}_{idx}.pgm")),
        })
    }

    fn frame_pattern(&self) -> Result<Regex, regex::Error> {
        Regex::new(&format!(
            r"^{}\d+\.{}$",
            regex::escape(&self.frame_prefix),
            regex::escape(&self.frame_extension)
        ))
    }

    /// Count the frame files present in `dir`.
    pub fn count_frames(&self, dir: &Path) -> io::Result<usize> {
        let pattern = self
            .frame_pattern()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let mut count = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.file_name().to_str().is_some_and(|name| pattern.is_match(name)) {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Number of frame-pair jobs available for `frames` frames.
pub fn job_count(frames: usize) -> usize {
    frames.saturating_sub(1)
}
