//! Launch session: the explicit object owning resolved configuration
//! state.
//!
//! A session holds the parsed raw configuration, the project root, and
//! the uploaded-mounts history, and walks the whole flow for one launch:
//! resolve the layered configuration, materialize mounts and runner
//! against a fresh interpolation context, run the mounts' local upload
//! steps (idempotently), compose the launch script, and dispatch it.

use std::collections::HashSet;
use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::Mapping;

use crate::compose::{ComposeOptions, SetupStage, compose};
use crate::config::{self, ConfigError, EffectiveConfig, Overrides};
use crate::context::Context;
use crate::discovery;
use crate::exec::{CommandRunner, TransportError};
use crate::launch::{
    DispatchOptions, Dispatcher, InstanceLauncher, LaunchError, LaunchHandle, LaunchSpec,
};
use crate::mount::{self, Mount};

/// One launch invocation: what to run, where, and how loudly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaunchRequest {
    /// Mode name selecting an entry under `modes`; `None` applies the
    /// base `run` section.
    pub mode: Option<String>,
    /// Command executed on the target.
    pub command: Vec<String>,
    /// Call-site configuration overrides.
    pub overrides: Overrides,
    /// Print the script and commands instead of executing.
    pub dry: bool,
    /// Log intermediate commands and the final script.
    pub verbose: bool,
}

impl LaunchRequest {
    /// Builds a request for `command` with default settings.
    #[must_use]
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }
}

/// Explicit session state for resolving and launching.
#[derive(Clone, Debug)]
pub struct Session {
    raw: Mapping,
    project_root: Utf8PathBuf,
    uploaded: HashSet<String>,
}

impl Session {
    /// Builds a session by searching the working directory and its
    /// ancestors for the configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] when no configuration file
    /// exists and [`ConfigError::Io`]/[`ConfigError::Parse`] when it
    /// cannot be read.
    pub fn discover() -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir().map_err(|err| ConfigError::Io {
            path: Utf8PathBuf::from("."),
            message: err.to_string(),
        })?;
        let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(|path| ConfigError::InvalidStructure {
            message: format!("working directory is not UTF-8: {}", path.display()),
        })?;
        let path = discovery::find_config(&cwd)?;
        Self::from_file(&path)
    }

    /// Builds a session from an explicit configuration file path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let raw = discovery::load_config(path)?;
        let project_root = path
            .parent()
            .unwrap_or_else(|| Utf8Path::new("."))
            .to_path_buf();
        Ok(Self {
            raw,
            project_root,
            uploaded: HashSet::new(),
        })
    }

    /// Builds a session from configuration text. Primarily used by
    /// tests and embedders.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the text is not a YAML
    /// mapping.
    pub fn from_config_text(
        contents: &str,
        project_root: impl Into<Utf8PathBuf>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            raw: discovery::parse_config(contents)?,
            project_root: project_root.into(),
            uploaded: HashSet::new(),
        })
    }

    /// Directory containing the configuration file.
    #[must_use]
    pub fn project_root(&self) -> &Utf8Path {
        &self.project_root
    }

    /// Resolves the layered configuration and captures a fresh
    /// interpolation context.
    ///
    /// Repeated calls with the same inputs produce configurations
    /// differing only in the context's time- and id-derived fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unknown modes, missing sections, or
    /// malformed sections.
    pub fn resolve(
        &self,
        mode: Option<&str>,
        overrides: &Overrides,
    ) -> Result<(EffectiveConfig, Context), ConfigError> {
        let config = config::resolve(&self.raw, mode, overrides)?;
        let mut extras = config.vars.clone();
        extras.extend(overrides.extras.clone());
        let context = Context::capture(&extras);
        Ok((config, context))
    }

    /// Runs each mount's local upload step once. A mount whose step has
    /// already run in this session is skipped and merely logged.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when an upload step cannot be spawned
    /// or exits non-zero.
    pub fn upload_mounts<R: CommandRunner>(
        &mut self,
        mounts: &[Mount],
        exec: &R,
        verbose: bool,
    ) -> Result<(), TransportError> {
        for mount in mounts {
            let script = mount.local_script.trim();
            if script.is_empty() {
                continue;
            }
            if !self.uploaded.insert(script.to_owned()) {
                tracing::info!("mount already uploaded; skipping");
                continue;
            }
            if verbose {
                tracing::info!(%script, "running mount upload step");
            }
            let args = vec![OsString::from("-c"), OsString::from(script)];
            let output = exec.run("bash", &args)?;
            if !output.is_success() {
                return Err(TransportError::command_failure("bash", &output));
            }
        }
        Ok(())
    }

    /// Clears the uploaded-mounts history, forcing the next launch to
    /// re-run every upload step.
    pub fn reset_uploads(&mut self) {
        self.uploaded.clear();
    }

    /// Walks the full launch flow and dispatches through `dispatcher`.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError`] for configuration, transport, or provider
    /// failures.
    pub async fn launch<R: CommandRunner, L: InstanceLauncher>(
        &mut self,
        dispatcher: &Dispatcher<R, L>,
        request: &LaunchRequest,
    ) -> Result<LaunchHandle, LaunchError> {
        let (config, context) = self.resolve(request.mode.as_deref(), &request.overrides)?;
        let verbose = config.verbose || request.verbose;

        let mounts = config
            .mounts
            .iter()
            .map(|spec| spec.materialize(&context))
            .collect::<Result<Vec<_>, _>>()?;

        if !request.dry {
            self.upload_mounts(&mounts, dispatcher.exec(), verbose)?;
        }

        let (host_pypath, container_pypath) = mount::pypath_strings(&mounts);
        let context = context.with_pypaths(&host_pypath, &container_pypath);
        let runner = config
            .runner
            .materialize(&context, &mounts, &request.command)?;

        let stage = if matches!(config.launch, LaunchSpec::Local(_)) {
            SetupStage::Remote
        } else {
            SetupStage::Host
        };
        let host = config.host.rendered(&context)?;
        let script = compose(&mounts, &runner, &ComposeOptions::from_host(&host, stage))?;
        if verbose {
            tracing::info!(script = %script, "composed launch script");
        }

        let options = DispatchOptions {
            dry: request.dry,
            verbose,
        };
        dispatcher.dispatch(&script, &config.launch, &options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::exec::CommandOutput;

    /// Records invocations instead of spawning processes.
    #[derive(Default)]
    struct RecordingRunner {
        invocations: RefCell<Vec<String>>,
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, TransportError> {
            self.invocations
                .borrow_mut()
                .push(crate::launch::render_command_line(program, args));
            Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            })
        }

        fn spawn(&self, program: &str, args: &[OsString]) -> Result<u32, TransportError> {
            self.invocations
                .borrow_mut()
                .push(crate::launch::render_command_line(program, args));
            Ok(4242)
        }
    }

    fn session() -> Session {
        Session::from_config_text("runner:\n  type: process\nlaunch:\n  type: local\n", "/tmp")
            .unwrap_or_else(|err| panic!("session: {err}"))
    }

    fn upload_mount(script: &str) -> Mount {
        Mount {
            local_script: script.to_owned(),
            ..Mount::default()
        }
    }

    #[test]
    fn upload_mounts_runs_each_step_once() {
        let mut session = session();
        let runner = RecordingRunner::default();
        let mounts = vec![upload_mount("echo one"), upload_mount("echo two")];

        session
            .upload_mounts(&mounts, &runner, false)
            .unwrap_or_else(|err| panic!("upload: {err}"));
        session
            .upload_mounts(&mounts, &runner, false)
            .unwrap_or_else(|err| panic!("second upload: {err}"));

        let invocations = runner.invocations.borrow();
        assert_eq!(invocations.len(), 2);
        assert!(invocations.first().is_some_and(|line| line.contains("echo one")));
        assert!(invocations.get(1).is_some_and(|line| line.contains("echo two")));
    }

    #[test]
    fn reset_uploads_forgets_history() {
        let mut session = session();
        let runner = RecordingRunner::default();
        let mounts = vec![upload_mount("echo once")];

        session
            .upload_mounts(&mounts, &runner, false)
            .unwrap_or_else(|err| panic!("upload: {err}"));
        session.reset_uploads();
        session
            .upload_mounts(&mounts, &runner, false)
            .unwrap_or_else(|err| panic!("re-upload: {err}"));

        assert_eq!(runner.invocations.borrow().len(), 2);
    }

    #[test]
    fn failing_upload_step_surfaces_transport_error() {
        struct FailingRunner;
        impl CommandRunner for FailingRunner {
            fn run(
                &self,
                _program: &str,
                _args: &[OsString],
            ) -> Result<CommandOutput, TransportError> {
                Ok(CommandOutput {
                    code: Some(1),
                    stderr: String::from("denied"),
                    ..CommandOutput::default()
                })
            }
            fn spawn(&self, _program: &str, _args: &[OsString]) -> Result<u32, TransportError> {
                Ok(0)
            }
        }

        let mut session = session();
        let err = session
            .upload_mounts(&[upload_mount("false")], &FailingRunner, false)
            .expect_err("failing upload should error");
        assert!(matches!(err, TransportError::CommandFailure { .. }));
    }

    #[test]
    fn resolve_exposes_extras_to_the_context() {
        let session = Session::from_config_text(
            "project: demo\nrunner:\n  type: process\nlaunch:\n  type: local\n",
            "/tmp",
        )
        .unwrap_or_else(|err| panic!("session: {err}"));
        let overrides = Overrides {
            extras: [(String::from("tag"), String::from("v1"))].into_iter().collect(),
            ..Overrides::default()
        };
        let (_, context) = session
            .resolve(None, &overrides)
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert_eq!(context.get("project"), Some("demo"));
        assert_eq!(context.get("tag"), Some("v1"));
    }
}
