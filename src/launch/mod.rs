//! Launch dispatch across the local, SSH, and EC2 backends.
//!
//! The dispatcher takes a composed [`LaunchScript`] and executes it
//! through the backend named in configuration. Transport and provider
//! errors propagate unmodified; a non-zero script exit code is not
//! interpreted here, the script's own log files are the diagnostic
//! channel. Dry dispatch performs no local side effect and returns the
//! exact script and commands that would have been used.

mod ec2;
mod local;
mod ssh;

use std::ffi::OsString;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub use ec2::{
    AwsEc2Launcher, Ec2Launch, InstanceDescriptor, InstanceLauncher, ProviderError, ProviderFuture,
};
pub use local::LocalLaunch;
pub use ssh::SshLaunch;

use crate::compose::LaunchScript;
use crate::config::ConfigError;
use crate::exec::{CommandOutput, CommandRunner, ProcessCommandRunner, TransportError};

/// Delay before the transient SSH script file is removed, giving the
/// transfer time to complete.
const SCP_GRACE: Duration = Duration::from_millis(100);

/// Backend selection and settings, tagged by `type` in configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LaunchSpec {
    /// Execute the script on the current machine.
    Local(LocalLaunch),
    /// Copy the script to a fixed host and execute it over SSH.
    Ssh(SshLaunch),
    /// Create an EC2 instance with the script as user-data.
    Ec2(Ec2Launch),
}

/// Per-dispatch options.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchOptions {
    /// Print/return the script and commands instead of executing.
    pub dry: bool,
    /// Log intermediate commands while executing.
    pub verbose: bool,
}

/// Discriminated result of a dispatch.
#[derive(Clone, Debug, PartialEq)]
pub enum LaunchHandle {
    /// A blocking local or SSH run finished; the captured output.
    Completed(CommandOutput),
    /// A detached child process was spawned locally.
    Detached {
        /// Pid of the detached child.
        pid: u32,
    },
    /// An on-demand instance was created.
    Instance(InstanceDescriptor),
    /// A spot request was filed; its request id.
    SpotRequest(String),
    /// Dry run: nothing was executed.
    DryRun(DryRunReport),
}

/// What a dry dispatch would have executed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DryRunReport {
    /// The fully composed launch script.
    pub script: String,
    /// Backend command lines, in execution order.
    pub commands: Vec<String>,
}

/// Errors surfaced by dispatch.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum LaunchError {
    /// Configuration was invalid for the selected backend.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// A transport command failed to stage, spawn, or complete.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// The cloud provider rejected the request.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Ships composed scripts to the selected backend.
#[derive(Clone, Debug)]
pub struct Dispatcher<R: CommandRunner, L: InstanceLauncher> {
    exec: R,
    launcher: L,
    scp_grace: Duration,
}

impl Dispatcher<ProcessCommandRunner, AwsEc2Launcher> {
    /// Builds a dispatcher wired to the real process runner and the AWS
    /// provider.
    #[must_use]
    pub fn with_process_runner() -> Self {
        Self::new(ProcessCommandRunner, AwsEc2Launcher::new())
    }
}

impl<R: CommandRunner, L: InstanceLauncher> Dispatcher<R, L> {
    /// Creates a dispatcher from a command runner and an instance
    /// launcher.
    #[must_use]
    pub const fn new(exec: R, launcher: L) -> Self {
        Self {
            exec,
            launcher,
            scp_grace: SCP_GRACE,
        }
    }

    /// Overrides the grace delay before the transient SSH script file is
    /// removed. Primarily used by tests.
    #[must_use]
    pub const fn with_scp_grace(mut self, grace: Duration) -> Self {
        self.scp_grace = grace;
        self
    }

    /// Returns the command runner, shared with mount uploads.
    #[must_use]
    pub const fn exec(&self) -> &R {
        &self.exec
    }

    /// Executes `script` on the backend selected by `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Transport`] for local/SSH failures and
    /// [`LaunchError::Provider`] for EC2 rejections.
    pub async fn dispatch(
        &self,
        script: &LaunchScript,
        spec: &LaunchSpec,
        options: &DispatchOptions,
    ) -> Result<LaunchHandle, LaunchError> {
        match spec {
            LaunchSpec::Local(local) => {
                Ok(local::dispatch(&self.exec, script, local, options)?)
            }
            LaunchSpec::Ssh(ssh) => Ok(ssh::dispatch(
                &self.exec,
                script,
                ssh,
                options,
                self.scp_grace,
            )?),
            LaunchSpec::Ec2(ec2) => ec2::dispatch(&self.launcher, script, ec2, options).await,
        }
    }
}

/// Renders a program and its arguments as one command line, for dry-run
/// reports and verbose logging.
pub(crate) fn render_command_line(program: &str, args: &[OsString]) -> String {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}
