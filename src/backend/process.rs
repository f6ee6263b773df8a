use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use super::BackendError;

/// Resolve a tool path. Relative paths prefer a file next to the running
/// executable and otherwise fall back to `PATH` / working-directory lookup.
pub(crate) fn resolve_tool(tool: &Path) -> PathBuf {
    if tool.is_absolute() {
        return tool.to_path_buf();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(tool)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| tool.to_path_buf())
}

fn spawn(command: &mut Command, program: &Path) -> Result<Child, BackendError> {
    command.spawn().map_err(|source| BackendError::Spawn {
        program: program.to_path_buf(),
        source,
    })
}

fn wait(child: &mut Child, program: &Path) -> Result<ExitStatus, BackendError> {
    child.wait().map_err(|source| BackendError::Wait {
        program: program.to_path_buf(),
        source,
    })
}

fn check(status: ExitStatus, program: &Path) -> Result<(), BackendError> {
    if status.success() {
        Ok(())
    } else {
        Err(BackendError::Exited {
            program: program.to_path_buf(),
            status,
        })
    }
}

/// Run `program` with `args` and require a zero exit status.
pub(crate) fn run(program: &Path, args: &[&std::ffi::OsStr]) -> Result<(), BackendError> {
    let mut child = spawn(
        Command::new(program).args(args).stdin(Stdio::null()),
        program,
    )?;
    let status = wait(&mut child, program)?;
    check(status, program)
}

/// Run `producer | consumer`, requiring both to exit cleanly.
pub(crate) fn run_piped(
    producer_program: &Path,
    producer_args: &[&std::ffi::OsStr],
    consumer_program: &Path,
    consumer_args: &[&std::ffi::OsStr],
) -> Result<(), BackendError> {
    let mut upstream = spawn(
        Command::new(producer_program)
            .args(producer_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped()),
        producer_program,
    )?;
    let pipe = match upstream.stdout.take() {
        Some(stdout) => Stdio::from(stdout),
        None => Stdio::null(),
    };
    let downstream = Command::new(consumer_program)
        .args(consumer_args)
        .stdin(pipe)
        .spawn();
    let mut downstream = match downstream {
        Ok(child) => child,
        Err(source) => {
            let _ = upstream.kill();
            let _ = upstream.wait();
            return Err(BackendError::Spawn {
                program: consumer_program.to_path_buf(),
                source,
            });
        }
    };
    let consumer_status = wait(&mut downstream, consumer_program);
    if consumer_status.is_err() {
        let _ = upstream.kill();
    }
    // Reap the producer before reporting either stage.
    let producer_status = wait(&mut upstream, producer_program);
    let consumer_status = consumer_status?;
    check(producer_status?, producer_program)?;
    check(consumer_status, consumer_program)
}
