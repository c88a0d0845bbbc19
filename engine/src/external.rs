//! Bounded runs of external model commands
//!
//! Detectors and transcribers are synchronous and run on the blocking pool,
//! but the model behind them is a child process that may hang. Each run gets
//! a deadline and the child is killed when the deadline passes.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("{program} could not run: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exceeded {secs}s and was killed")]
    TimedOut { program: String, secs: u64 },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Run `command` with `input` appended as its last argument and return stdout
///
/// Usable from a blocking-pool thread inside the runtime or from plain
/// threads outside one.
pub fn run_model_command(
    command: &[String],
    input: &Path,
    timeout: Duration,
) -> Result<Vec<u8>, CommandError> {
    let program = command.first().ok_or(CommandError::Empty)?.clone();
    let io_err = |source| CommandError::Io {
        program: program.clone(),
        source,
    };

    let fut = async {
        let child = Command::new(&program)
            .args(&command[1..])
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(io_err)?;

        // Dropping the wait future on timeout drops the child, which kills it
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(io_err),
            Err(_) => {
                warn!(program = %program, secs = timeout.as_secs(), "Model command timed out");
                Err(CommandError::TimedOut {
                    program: program.clone(),
                    secs: timeout.as_secs(),
                })
            }
        }
    };

    let output = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.block_on(fut)?,
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(io_err)?
            .block_on(fut)?,
    };

    if !output.status.success() {
        return Err(CommandError::Failed {
            program,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    debug!(program = %program, bytes = output.stdout.len(), "Model command finished");
    Ok(output.stdout)
}

/// Remove a scratch file, logging instead of failing
pub fn remove_scratch(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "Scratch file not removed");
    }
}
