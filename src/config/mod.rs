//! Settings file and resolved run configuration.
//!
//! `flowfarm.toml` holds per-node defaults (tool locations, concurrency,
//! frame naming). The binary layers its arguments on top and hands the core
//! a [`RunConfig`].

mod errors;
mod io;
mod types;


pub use errors::ConfigError;
pub use io::{CONFIG_FILE_NAME, config_path, load_from, load_or_default, save_to_path};
pub use types::{
    MAX_JOBS_ENV, MAX_JOBS_LIMIT, RunConfig, RunOverrides, Settings, ToolPaths,
};

/// Check the shared directory is reachable before any claim is attempted.
pub fn ensure_shared_dir(config: &RunConfig) -> Result<(), ConfigError> {
    if config.shared_dir.is_dir() {
        Ok(())
    } else {
        Err(ConfigError::SharedDir {
            path: config.shared_dir.clone(),
        })
    }
}
