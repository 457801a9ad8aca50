//! SSH execution backend.
//!
//! The script is written to a transient local file, copied to the host
//! with `scp`, and executed with `ssh`. The uploaded script ends with a
//! best-effort cleanup trailer that kills any process still matching the
//! script's file name, so no orphaned background shell remains. The
//! local file is deleted after a short grace delay; in dry mode it is
//! kept for inspection and the would-be commands are returned instead of
//! executed.

use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tempfile::NamedTempFile;

use crate::compose::LaunchScript;
use crate::exec::{CommandRunner, TransportError};

use super::{DispatchOptions, DryRunReport, LaunchHandle, render_command_line};

/// Settings for executing the script on a fixed SSH host.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SshLaunch {
    /// Host IP address or name.
    pub ip: String,
    /// SSH port; the client default applies when unset.
    #[serde(default)]
    pub port: Option<u16>,
    /// Remote user name.
    #[serde(default = "default_username")]
    pub username: String,
    /// Private key file; supports `~/` expansion.
    #[serde(default)]
    pub pem: Option<String>,
    /// Execute the script under sudo.
    #[serde(default)]
    pub sudo: bool,
    /// Spawn the remote session without blocking the caller.
    #[serde(default = "default_true")]
    pub detached: bool,
    /// Remote directory receiving the script file.
    #[serde(default = "default_script_dir")]
    pub script_dir: String,
}

fn default_username() -> String {
    String::from("ubuntu")
}

const fn default_true() -> bool {
    true
}

fn default_script_dir() -> String {
    String::from("~")
}

pub(super) fn dispatch<R: CommandRunner>(
    exec: &R,
    script: &LaunchScript,
    spec: &SshLaunch,
    options: &DispatchOptions,
    grace: Duration,
) -> Result<LaunchHandle, TransportError> {
    let staged = StagedScript::new(script, spec)?;
    let upload_args = scp_args(spec, staged.local_path());
    let exec_args = ssh_args(spec, &staged.remote_path);

    if options.dry {
        let commands = vec![
            render_command_line("scp", &upload_args),
            render_command_line("ssh", &exec_args),
        ];
        let kept = staged.keep()?;
        tracing::info!(script = %kept, "dry run: launcher script kept for inspection");
        return Ok(LaunchHandle::DryRun(DryRunReport {
            script: script.as_str().to_owned(),
            commands,
        }));
    }

    if options.verbose {
        tracing::info!(command = %render_command_line("scp", &upload_args), "uploading launcher script");
    }
    let upload = exec.run("scp", &upload_args)?;
    if !upload.is_success() {
        return Err(TransportError::command_failure("scp", &upload));
    }

    if options.verbose {
        tracing::info!(command = %render_command_line("ssh", &exec_args), "executing launcher script");
    }
    let handle = if spec.detached {
        let pid = exec.spawn("ssh", &exec_args)?;
        LaunchHandle::Detached { pid }
    } else {
        LaunchHandle::Completed(exec.run("ssh", &exec_args)?)
    };

    std::thread::sleep(grace);
    staged.cleanup();
    Ok(handle)
}

/// The transient local script file, owned by one dispatch call.
struct StagedScript {
    file: NamedTempFile,
    remote_path: String,
}

impl StagedScript {
    fn new(script: &LaunchScript, spec: &SshLaunch) -> Result<Self, TransportError> {
        let mut file = tempfile::Builder::new()
            .prefix("skiff_launcher-")
            .suffix(".sh")
            .tempfile()
            .map_err(|err| TransportError::Script {
                message: err.to_string(),
            })?;

        let script_name = file
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("skiff_launcher.sh")
            .to_owned();

        // The kill target is matched by script file name; sudo because the
        // script itself may have been started under sudo.
        let contents = format!(
            "{body}\nsudo kill $(ps aux | grep '{script_name}' | awk '{{print $2}}') || true\necho 'cleaned up launcher processes'\n",
            body = script.as_str().trim_end(),
        );
        file.write_all(contents.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|err| TransportError::Script {
                message: err.to_string(),
            })?;

        let remote_path = format!(
            "{}/{script_name}",
            spec.script_dir.trim_end_matches('/')
        );
        Ok(Self { file, remote_path })
    }

    fn local_path(&self) -> &Path {
        self.file.path()
    }

    /// Persists the file (dry run) and returns its path.
    fn keep(self) -> Result<String, TransportError> {
        let (_file, path) = self.file.keep().map_err(|err| TransportError::Script {
            message: err.to_string(),
        })?;
        Ok(path.display().to_string())
    }

    /// Removes the file; failures are advisory only.
    fn cleanup(self) {
        if let Err(err) = self.file.close() {
            tracing::warn!(error = %err, "failed to remove transient launcher script");
        }
    }
}

fn scp_args(spec: &SshLaunch, local_path: &Path) -> Vec<OsString> {
    let mut args = common_options(spec);
    if let Some(port) = spec.port {
        args.push(OsString::from("-P"));
        args.push(OsString::from(port.to_string()));
    }
    args.push(local_path.as_os_str().to_owned());
    args.push(OsString::from(format!(
        "{}@{}:{}/",
        spec.username,
        spec.ip,
        spec.script_dir.trim_end_matches('/')
    )));
    args
}

fn ssh_args(spec: &SshLaunch, remote_path: &str) -> Vec<OsString> {
    let mut args = common_options(spec);
    if let Some(port) = spec.port {
        args.push(OsString::from("-p"));
        args.push(OsString::from(port.to_string()));
    }
    args.push(OsString::from(format!("{}@{}", spec.username, spec.ip)));
    let sudo = if spec.sudo { "sudo " } else { "" };
    args.push(OsString::from(format!("{sudo}bash {remote_path}")));
    args
}

fn common_options(spec: &SshLaunch) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("-o"),
        OsString::from("StrictHostKeyChecking=no"),
    ];
    if let Some(pem) = &spec.pem {
        args.push(OsString::from("-i"));
        args.push(OsString::from(expand_key_path(pem)));
    }
    args
}

/// Key paths from configuration often start with `~/`; `scp` and `ssh`
/// receive them already expanded. Without `HOME` the path passes through
/// unchanged.
fn expand_key_path(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => format!("{}/{rest}", home.to_string_lossy()),
        _ => path.to_owned(),
    }
}
