//! Forward/backward consistency check.
//!
//! Delegated to an external checker invoked as
//! `consistencyChecker <backward.flo> <forward.flo> <reliable.pgm> <end frame>`.
//! The reliability map it writes is kept as a final artifact.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::process::{resolve_tool, run};

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error(transparent)]
    Tool(#[from] BackendError),
    #[error("Consistency checker did not write {path}")]
    MissingOutput { path: PathBuf },
}

/// Invokes the external consistency checker.
#[derive(Debug, Clone)]
pub struct ConsistencyChecker {
    program: PathBuf,
}

impl ConsistencyChecker {
    pub fn new(program: &Path) -> Self {
        Self {
            program: resolve_tool(program),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Produce the reliability map of `backward` against `forward`.
    pub fn check(
        &self,
        backward: &Path,
        forward: &Path,
        reliability: &Path,
        end_frame: &Path,
    ) -> Result<(), ConsistencyError> {
        run(
            &self.program,
            &[
                backward.as_os_str(),
                forward.as_os_str(),
                reliability.as_os_str(),
                end_frame.as_os_str(),
            ],
        )?;
        if !reliability.is_file() {
            return Err(ConsistencyError::MissingOutput {
                path: reliability.to_path_buf(),
            });
        }
        Ok(())
    }
}
