//! Command execution seam shared by the launch backends.
//!
//! Dispatch shells out to `bash`, `scp`, and `ssh`. Keeping the calls
//! behind a trait lets tests substitute a recording fake, so no dispatch
//! test ever spawns a real process.

use std::ffi::OsString;
use std::process::{Command, Stdio};

use thiserror::Error;

/// Errors raised while staging or executing transport commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// The command never started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that could not be launched.
        program: String,
        /// Message from the operating system.
        message: String,
    },
    /// The command ran but exited non-zero.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Raw exit status, if the OS reported one.
        status: Option<i32>,
        /// Printable form of the exit status.
        status_text: String,
        /// Stderr the process left behind.
        stderr: String,
    },
    /// Raised when the transient launch script cannot be staged.
    #[error("failed to stage launch script: {message}")]
    Script {
        /// Underlying error message.
        message: String,
    },
}

impl TransportError {
    /// Builds a [`TransportError::CommandFailure`] from a captured
    /// output.
    #[must_use]
    pub fn command_failure(program: &str, output: &CommandOutput) -> Self {
        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Self::CommandFailure {
            program: program.to_owned(),
            status: output.code,
            status_text,
            stderr: output.stderr.clone(),
        }
    }

    fn spawn_failure(program: &str, err: &std::io::Error) -> Self {
        Self::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        }
    }
}

/// What a completed command left behind: its exit code and the captured
/// streams.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
    /// Everything the command wrote to stdout.
    pub stdout: String,
    /// Everything the command wrote to stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// `true` only for a zero exit code.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Trait the dispatch paths go through instead of `std::process`
/// directly.
pub trait CommandRunner {
    /// Runs `program` to completion, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] if the command cannot be
    /// started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, TransportError>;

    /// Spawns `program` detached and returns its pid without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] if the command cannot be
    /// started.
    fn spawn(&self, program: &str, args: &[OsString]) -> Result<u32, TransportError>;
}

/// The production runner: plain `std::process` invocations.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, TransportError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| TransportError::spawn_failure(program, &err))?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, program: &str, args: &[OsString]) -> Result<u32, TransportError> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map(|child| child.id())
            .map_err(|err| TransportError::spawn_failure(program, &err))
    }
}
