//! Library exports for the flow farm binary, benchmarks and tests.
/// Per-user application directories.
pub mod app_dirs;
/// Optical-flow estimators.
pub mod backend;
/// Exclusive job claims through the shared directory.
pub mod claim;
/// Command-line parsing for the binary.
pub mod cli;
/// Binary `.flo` reader and writer.
pub mod codec;
/// Settings file and resolved run configuration.
pub mod config;
/// Forward/backward consistency check.
pub mod consistency;
/// Logging setup.
pub mod logging;
/// File naming shared by every cooperating worker.
pub mod naming;
/// Per-job flow pipeline.
pub mod pipeline;
/// Bounded claim-and-dispatch scheduler.
pub mod pool;
