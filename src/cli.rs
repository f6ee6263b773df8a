//! Command-line parsing for the `flowfarm` binary.

use std::path::PathBuf;

use crate::config::RunOverrides;

/// Parsed arguments of one `flowfarm` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOptions {
    pub overrides: RunOverrides,
    /// Explicit settings file replacing the app-dir `flowfarm.toml`.
    pub config: Option<PathBuf>,
    /// Where to write the JSON run summary.
    pub summary: Option<PathBuf>,
}

/// Parse arguments (without the program name).
///
/// Returns `Ok(None)` when help was printed.
pub fn parse_args(args: Vec<String>) -> Result<Option<CliOptions>, String> {
    let mut options = CliOptions::default();
    let mut shared_dir: Option<PathBuf> = None;
    let mut idx = 0usize;
    while idx < args.len() {
        let arg = args[idx].as_str();
        match arg {
            "-h" | "--help" => {
                println!("{}", help_text());
                return Ok(None);
            }
            "--test" => options.overrides.test = true,
            "--fast" => options.overrides.fast = true,
            "--max-jobs" => {
                let value = parse_positive(&args, &mut idx, "--max-jobs")?;
                options.overrides.max_jobs = Some(value);
            }
            "--start" => {
                let value = parse_positive(&args, &mut idx, "--start")?;
                let value = u32::try_from(value)
                    .map_err(|_| format!("Invalid --start value: {value}"))?;
                options.overrides.start_index = Some(value);
            }
            "--config" => {
                options.config = Some(PathBuf::from(value_after(&args, &mut idx, "--config")?));
            }
            "--summary" => {
                options.summary = Some(PathBuf::from(value_after(&args, &mut idx, "--summary")?));
            }
            flag if flag.starts_with('-') && flag.len() > 1 => {
                return Err(format!("Unknown argument: {flag}\n\n{}", help_text()));
            }
            path => {
                if shared_dir.is_some() {
                    return Err(format!("Unexpected extra argument: {path}"));
                }
                shared_dir = Some(PathBuf::from(path));
            }
        }
        idx += 1;
    }
    let Some(shared_dir) = shared_dir else {
        return Err(format!("Missing shared directory\n\n{}", help_text()));
    };
    options.overrides.shared_dir = shared_dir;
    Ok(Some(options))
}

fn parse_positive(args: &[String], idx: &mut usize, flag: &str) -> Result<usize, String> {
    let value = value_after(args, idx, flag)?;
    match value.parse::<usize>() {
        Ok(parsed) if parsed >= 1 => Ok(parsed),
        _ => Err(format!("Invalid {flag} value: {value}")),
    }
}

fn value_after<'a>(args: &'a [String], idx: &mut usize, flag: &str) -> Result<&'a str, String> {
    *idx += 1;
    let value = args
        .get(*idx)
        .ok_or_else(|| format!("{flag} requires a value"))?;
    Ok(value)
}

pub fn help_text() -> &'static str {
    "Usage: flowfarm <shared-dir> [options]\n\n\
Claims frame pairs in <shared-dir> and computes their optical flow.\n\
Run the same command on every node mounting the directory.\n\n\
Options:\n\
  --test               Only consider the first few frames (test_frame_count)\n\
  --fast               Use the in-process Farneback estimator\n\
  --max-jobs <n>       Concurrent pipelines on this node (default: 4)\n\
  --start <n>          First job index (default: 1)\n\
  --config <path>      Settings file (default: <app dir>/flowfarm.toml)\n\
  --summary <path>     Write the run summary as JSON\n\
  -h, --help           Show this help\n\n\
Environment:\n\
  FLOWFARM_MAX_JOBS    Overrides max_jobs from the settings file\n\
  FLOWFARM_CONFIG_HOME Base directory for .flowfarm (settings, logs)\n"
}
