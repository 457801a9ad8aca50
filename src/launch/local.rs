//! Local execution backend.

use std::ffi::OsString;

use serde::Deserialize;

use crate::compose::LaunchScript;
use crate::exec::{CommandRunner, TransportError};

use super::{DispatchOptions, DryRunReport, LaunchHandle, render_command_line};

/// Settings for executing the script on the current machine.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct LocalLaunch {
    /// Spawn without blocking and return immediately.
    #[serde(default)]
    pub detached: bool,
}

pub(super) fn dispatch<R: CommandRunner>(
    exec: &R,
    script: &LaunchScript,
    spec: &LocalLaunch,
    options: &DispatchOptions,
) -> Result<LaunchHandle, TransportError> {
    let args = vec![OsString::from("-c"), OsString::from(script.as_str())];

    if options.dry {
        return Ok(LaunchHandle::DryRun(DryRunReport {
            script: script.as_str().to_owned(),
            commands: vec![String::from("bash -c <launch script>")],
        }));
    }

    if options.verbose {
        tracing::info!(detached = spec.detached, "executing launch script locally");
    }

    if spec.detached {
        let pid = exec.spawn("bash", &args)?;
        tracing::debug!(pid, "local launch detached");
        return Ok(LaunchHandle::Detached { pid });
    }

    let output = exec.run("bash", &args)?;
    if options.verbose {
        tracing::debug!(
            command = %render_command_line("bash", &args[..1]),
            code = ?output.code,
            "local launch finished"
        );
    }
    Ok(LaunchHandle::Completed(output))
}
