//! Runner specifications: how the user command is executed on the
//! target.
//!
//! Runners are tagged by `type` in configuration. Settings are rendered
//! against the interpolation context *before* the runner value object is
//! constructed, so the resulting [`Runner`] carries fully resolved
//! fragments.

use std::collections::BTreeMap;

use serde::Deserialize;
use shell_escape::unix::escape;

use crate::config::ConfigError;
use crate::context::Context;
use crate::mount::{Mount, docker_mount_string, pypath_strings};

/// Runner specification as written in configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerSpec {
    /// Run the command inside a docker container.
    Docker(DockerSpec),
    /// Run the command as a bare process on the target.
    Process(ProcessSpec),
}

/// Settings for the docker runner.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DockerSpec {
    /// Image to run; supports interpolation (e.g. `{project}:latest`).
    pub image: String,
    /// Container name template; defaults to `skiff-{uuid}`.
    #[serde(default)]
    pub name: Option<String>,
    /// Working directory inside the container.
    #[serde(default)]
    pub work_dir: Option<String>,
    /// Environment variables exported into the container.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Whether to request all GPUs.
    #[serde(default)]
    pub use_gpu: bool,
    /// Whether to share the host IPC namespace.
    #[serde(default)]
    pub ipc_host: bool,
    /// Whether to pull the image before running.
    #[serde(default)]
    pub pull: bool,
    /// Free-form setup fragment prepended to the run.
    #[serde(default)]
    pub setup: Option<String>,
    /// Free-form fragment appended after the run.
    #[serde(default)]
    pub post: Option<String>,
}

/// Settings for the bare-process runner.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Directory the command runs in; defaults to the launch directory.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    /// Environment variables exported before the command.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    /// Free-form setup fragment prepended to the run.
    #[serde(default)]
    pub setup: Option<String>,
    /// Free-form fragment appended after the run.
    #[serde(default)]
    pub post: Option<String>,
}

fn default_work_dir() -> String {
    String::from("{cwd}")
}

impl RunnerSpec {
    /// Resolves the specification into a [`Runner`], rendering every
    /// setting against the context and weaving in the mount set and the
    /// user command.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnresolvedPlaceholder`] when a setting
    /// references a name the context cannot supply.
    pub fn materialize(
        &self,
        context: &Context,
        mounts: &[Mount],
        command: &[String],
    ) -> Result<Runner, ConfigError> {
        match self {
            Self::Docker(spec) => spec.materialize(context, mounts, command),
            Self::Process(spec) => spec.materialize(context, mounts, command),
        }
    }
}

impl DockerSpec {
    fn materialize(
        &self,
        context: &Context,
        mounts: &[Mount],
        command: &[String],
    ) -> Result<Runner, ConfigError> {
        let image = context.render(&self.image)?;
        let name = match &self.name {
            Some(template) => context.render(template)?,
            None => format!("skiff-{}", context.run_id()),
        };
        let (_, container_pypath) = pypath_strings(mounts);

        let mut run = String::from("docker run --rm");
        if self.use_gpu {
            run.push_str(" --gpus all");
        }
        if self.ipc_host {
            run.push_str(" --ipc host");
        }
        for (key, value) in &self.envs {
            let value = context.render(value)?;
            run.push_str(&format!(" -e {key}={}", escape(value.as_str().into())));
        }
        if !container_pypath.is_empty() {
            run.push_str(&format!(
                " -e PYTHONPATH={}",
                escape(container_pypath.as_str().into())
            ));
        }
        let binds = docker_mount_string(mounts);
        if !binds.is_empty() {
            run.push(' ');
            run.push_str(&binds);
        }
        if let Some(work_dir) = &self.work_dir {
            let work_dir = context.render(work_dir)?;
            run.push_str(&format!(" -w {}", escape(work_dir.as_str().into())));
        }
        let command_line = render_command(command);
        run.push_str(&format!(
            " --name {name} {image} /bin/bash -c {}",
            escape(command_line.as_str().into())
        ));

        let mut setup_lines = Vec::new();
        if self.pull {
            setup_lines.push(format!("docker pull {image}"));
        }
        if let Some(setup) = &self.setup {
            let setup = context.render(setup)?;
            if !setup.trim().is_empty() {
                setup_lines.push(setup.trim().to_owned());
            }
        }

        Ok(Runner {
            setup_script: setup_lines.join("\n"),
            run_script: run,
            post_script: rendered_or_empty(context, self.post.as_deref())?,
        })
    }
}

impl ProcessSpec {
    fn materialize(
        &self,
        context: &Context,
        mounts: &[Mount],
        command: &[String],
    ) -> Result<Runner, ConfigError> {
        let work_dir = context.render(&self.work_dir)?;
        let (host_pypath, _) = pypath_strings(mounts);

        let mut run = format!("cd {}", escape(work_dir.as_str().into()));
        if !host_pypath.is_empty() {
            run.push_str(&format!(
                "\nexport PYTHONPATH={}:$PYTHONPATH",
                escape(host_pypath.as_str().into())
            ));
        }
        for (key, value) in &self.envs {
            let value = context.render(value)?;
            run.push_str(&format!(
                "\nexport {key}={}",
                escape(value.as_str().into())
            ));
        }
        run.push('\n');
        run.push_str(&render_command(command));

        Ok(Runner {
            setup_script: rendered_or_empty(context, self.setup.as_deref())?,
            run_script: run,
            post_script: rendered_or_empty(context, self.post.as_deref())?,
        })
    }
}

fn rendered_or_empty(context: &Context, fragment: Option<&str>) -> Result<String, ConfigError> {
    match fragment {
        Some(text) => Ok(context.render(text)?.trim().to_owned()),
        None => Ok(String::new()),
    }
}

/// Shell-escapes and joins the user command into one line.
#[must_use]
pub fn render_command(args: &[String]) -> String {
    let mut line = String::new();
    for (index, arg) in args.iter().enumerate() {
        if index > 0 {
            line.push(' ');
        }
        line.push_str(escape(arg.as_str().into()).as_ref());
    }
    line
}

/// Resolved runner: immutable setup/run/post fragments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Runner {
    /// Fragment executed before the run command.
    pub setup_script: String,
    /// The command invocation itself.
    pub run_script: String,
    /// Fragment executed after the run command.
    pub post_script: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn context() -> Context {
        let timestamp = chrono::Local
            .with_ymd_and_hms(2024, 5, 17, 8, 0, 0)
            .single()
            .unwrap_or_else(|| panic!("timestamp should be unambiguous"));
        let mut values = BTreeMap::new();
        values.insert(String::from("cwd"), String::from("/work/demo"));
        values.insert(String::from("project"), String::from("demo"));
        Context::fixed(timestamp, "feedbeef", values)
    }

    fn pypath_mount() -> Mount {
        Mount {
            host_path: String::from("/home/ubuntu/project"),
            container_path: String::from("/project"),
            pypath: true,
            docker_mount: String::from("-v /home/ubuntu/project:/project"),
            ..Mount::default()
        }
    }

    #[test]
    fn docker_runner_renders_image_name_and_command() {
        let spec = RunnerSpec::Docker(DockerSpec {
            image: String::from("{project}:latest"),
            name: None,
            work_dir: Some(String::from("/project")),
            envs: BTreeMap::new(),
            use_gpu: true,
            ipc_host: false,
            pull: true,
            setup: None,
            post: None,
        });
        let command = vec![String::from("python"), String::from("train.py")];
        let runner = spec
            .materialize(&context(), &[pypath_mount()], &command)
            .unwrap_or_else(|err| panic!("materialize: {err}"));

        assert_eq!(runner.setup_script, "docker pull demo:latest");
        assert!(runner.run_script.starts_with("docker run --rm --gpus all"));
        assert!(runner.run_script.contains("-e PYTHONPATH=/project"));
        assert!(runner.run_script.contains("-v /home/ubuntu/project:/project"));
        assert!(runner.run_script.contains("-w /project"));
        assert!(runner.run_script.contains("--name skiff-feedbeef"));
        assert!(
            runner
                .run_script
                .ends_with("demo:latest /bin/bash -c 'python train.py'")
        );
        assert!(runner.post_script.is_empty());
    }

    #[test]
    fn process_runner_exports_paths_before_the_command() {
        let mut envs = BTreeMap::new();
        envs.insert(String::from("RUN_ID"), String::from("{uuid}"));
        let spec = RunnerSpec::Process(ProcessSpec {
            work_dir: String::from("{cwd}"),
            envs,
            setup: Some(String::from("echo preparing")),
            post: Some(String::from("echo done")),
        });
        let command = vec![String::from("./job.sh")];
        let runner = spec
            .materialize(&context(), &[pypath_mount()], &command)
            .unwrap_or_else(|err| panic!("materialize: {err}"));

        assert_eq!(runner.setup_script, "echo preparing");
        let lines: Vec<&str> = runner.run_script.lines().collect();
        assert_eq!(lines.first().copied(), Some("cd /work/demo"));
        assert_eq!(
            lines.get(1).copied(),
            Some("export PYTHONPATH=/home/ubuntu/project:$PYTHONPATH")
        );
        assert_eq!(lines.get(2).copied(), Some("export RUN_ID=feedbeef"));
        assert_eq!(lines.last().copied(), Some("./job.sh"));
        assert_eq!(runner.post_script, "echo done");
    }

    #[test]
    fn command_arguments_are_escaped() {
        let rendered = render_command(&[
            String::from("echo"),
            String::from("a b"),
            String::from("c'd"),
        ]);
        assert_eq!(rendered, "echo 'a b' 'c'\\''d'");
    }

    #[test]
    fn unresolved_runner_setting_fails_materialization() {
        let spec = RunnerSpec::Docker(DockerSpec {
            image: String::from("{missing}"),
            name: None,
            work_dir: None,
            envs: BTreeMap::new(),
            use_gpu: false,
            ipc_host: false,
            pull: false,
            setup: None,
            post: None,
        });
        assert!(matches!(
            spec.materialize(&context(), &[], &[String::from("true")]),
            Err(ConfigError::UnresolvedPlaceholder { .. })
        ));
    }
}
