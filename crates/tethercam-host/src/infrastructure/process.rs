//! Subprocess runner shared by the `usbipd` and `wsl` drivers.
//!
//! Every external tool invocation goes through [`run`], which captures
//! stdout/stderr as opaque text and enforces a hard upper bound on runtime.
//!
//! # Forceful termination
//!
//! Children are spawned with `kill_on_drop(true)`.  When a caller abandons
//! the future returned by [`run`] (because its own, tighter stage timeout
//! fired, or a session was aborted), dropping the future drops the
//! [`tokio::process::Child`], which kills the process instead of leaving it
//! running with the USB device still claimed.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Best single line of diagnostics: stderr if present, otherwise stdout.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    /// Case-insensitive search for any of `needles` in stdout or stderr.
    pub fn mentions_any(&self, needles: &[&str]) -> bool {
        let stdout = self.stdout.to_lowercase();
        let stderr = self.stderr.to_lowercase();
        needles
            .iter()
            .any(|needle| stdout.contains(needle) || stderr.contains(needle))
    }
}

/// Low-level failure to run a tool at all.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{program} was not found")]
    NotFound { program: String },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
    #[error("I/O error waiting for {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Error vocabulary shared by the host and guest driver traits.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// The facility itself (tool binary, system service, guest) is not available.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The tool ran and refused the operation.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<ProcessError> for DriverError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::NotFound { .. } | ProcessError::Spawn { .. } => {
                DriverError::Unavailable(err.to_string())
            }
            ProcessError::TimedOut { timeout, .. } => DriverError::Timeout(timeout),
            ProcessError::Io { .. } => DriverError::Rejected(err.to_string()),
        }
    }
}

/// Runs `program` with `args`, killing it if it outlives `timeout`.
///
/// # Errors
///
/// Returns [`ProcessError`] when the program cannot be spawned, times out, or
/// its output cannot be collected.  A non-zero exit status is *not* an error;
/// inspect [`ToolOutput::exit_code`].
pub async fn run<P, I, S>(program: P, args: I, timeout: Duration) -> Result<ToolOutput, ProcessError>
where
    P: AsRef<OsStr>,
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program_name = program.as_ref().to_string_lossy().into_owned();
    let mut command = Command::new(program.as_ref());
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("running {program_name}");
    let child = command.spawn().map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ProcessError::NotFound {
                program: program_name.clone(),
            }
        } else {
            ProcessError::Spawn {
                program: program_name.clone(),
                source,
            }
        }
    })?;

    match time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let out = ToolOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            debug!("{program_name} exited with {:?}", out.exit_code);
            Ok(out)
        }
        Ok(Err(source)) => Err(ProcessError::Io {
            program: program_name,
            source,
        }),
        Err(_) => Err(ProcessError::TimedOut {
            program: program_name,
            timeout,
        }),
    }
}

/// Quotes `value` for safe interpolation into a POSIX shell command line.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
