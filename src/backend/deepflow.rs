use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use super::process::{resolve_tool, run_piped};
use super::{BackendError, BackendKind, FlowBackend, FlowRequest};
use crate::codec;

/// DeepMatching feeding DeepFlow2, once per direction.
///
/// Matching runs on frames downscaled by two with `-nt 0` leaving the thread
/// count to DeepMatching. DeepFlow2 refines from the piped matches and writes
/// the `.flo` file itself.
#[derive(Debug, Clone)]
pub struct DeepFlowBackend {
    deepmatching: PathBuf,
    deepflow2: PathBuf,
}

impl DeepFlowBackend {
    pub fn new(deepmatching: PathBuf, deepflow2: PathBuf) -> Self {
        Self {
            deepmatching: resolve_tool(&deepmatching),
            deepflow2: resolve_tool(&deepflow2),
        }
    }

    fn one_direction(&self, from: &Path, to: &Path, out: &Path) -> Result<(), BackendError> {
        run_piped(
            &self.deepmatching,
            &[
                from.as_os_str(),
                to.as_os_str(),
                OsStr::new("-nt"),
                OsStr::new("0"),
                OsStr::new("-downscale"),
                OsStr::new("2"),
            ],
            &self.deepflow2,
            &[
                from.as_os_str(),
                to.as_os_str(),
                out.as_os_str(),
                OsStr::new("-match"),
            ],
        )?;
        let (width, height) = codec::read_dimensions(out)?;
        tracing::debug!("DeepFlow2 wrote {width}x{height} field to {}", out.display());
        Ok(())
    }
}

impl FlowBackend for DeepFlowBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Accurate
    }

    fn compute(&self, request: &FlowRequest<'_>) -> Result<(), BackendError> {
        self.one_direction(request.start_frame, request.end_frame, request.forward)?;
        self.one_direction(request.end_frame, request.start_frame, request.backward)
    }
}
