//! Launch script composition.
//!
//! The composer assembles one self-contained shell script in a fixed
//! order: shebang and `set +o posix` (process substitution is used for
//! log capture), log directory creation, then a grouped block whose
//! stdout and stderr are teed into `launch.log` and `launch.err.log`.
//! Inside the block: tooling bootstrap, optional instance self-tagging,
//! the mounts' setup fragments in mount order, the mounts' upload
//! fragments, the runner's setup/run/post fragments, an optional sleep,
//! and an optional self-termination block. Empty fragments contribute
//! nothing.

use std::fmt;

use serde::Deserialize;

use crate::config::ConfigError;
use crate::context::Context;
use crate::mount::Mount;
use crate::runner::Runner;

/// Stdout log file name under the log directory.
pub const LAUNCH_LOG_FILE: &str = "launch.log";
/// Stderr log file name under the log directory.
pub const LAUNCH_ERROR_LOG_FILE: &str = "launch.err.log";
/// Provider limit on instance tag values.
pub const MAX_INSTANCE_TAG_LENGTH: usize = 128;
/// Default log directory when the host section does not set one.
pub const DEFAULT_LOG_DIR: &str = "/tmp/skiff";

/// Bootstrap fragment installing the AWS CLI when it is missing; used
/// for host scripts unless the configuration supplies its own setup.
pub const AWS_CLI_BOOTSTRAP: &str = "if ! type aws > /dev/null 2>&1; then
    pip install awscli --upgrade --user
fi";

/// Which mount fragment family the composition consumes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetupStage {
    /// The script runs directly on the execution target; mounts
    /// contribute their `remote_setup` fragments.
    Remote,
    /// The script runs on a provisioned host; mounts contribute their
    /// `host_setup` fragments and the AWS CLI bootstrap applies by
    /// default.
    Host,
}

/// Host-script options from the `host` configuration section.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct HostOptions {
    /// Directory receiving the launch logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Bootstrap fragment override; an empty string disables the
    /// default AWS CLI bootstrap.
    #[serde(default)]
    pub setup: Option<String>,
    /// Tag applied to the running instance by the script itself.
    #[serde(default)]
    pub instance_tag: Option<String>,
    /// Provider region, required for tagging and self-termination.
    #[serde(default)]
    pub region: Option<String>,
    /// Whether the script terminates its own instance when done.
    #[serde(default)]
    pub terminate_after: bool,
    /// Seconds to sleep before the script ends (or terminates).
    #[serde(default)]
    pub delay: Option<u64>,
}

fn default_log_dir() -> String {
    String::from(DEFAULT_LOG_DIR)
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            setup: None,
            instance_tag: None,
            region: None,
            terminate_after: false,
            delay: None,
        }
    }
}

impl HostOptions {
    /// Renders every templated field against the interpolation context,
    /// so the composed script never carries an unresolved placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnresolvedPlaceholder`] when a field
    /// references a name the context cannot supply.
    pub fn rendered(&self, context: &Context) -> Result<Self, ConfigError> {
        let render_opt = |field: Option<&str>| field.map(|text| context.render(text)).transpose();
        Ok(Self {
            log_dir: context.render(&self.log_dir)?,
            setup: render_opt(self.setup.as_deref())?,
            instance_tag: render_opt(self.instance_tag.as_deref())?,
            region: render_opt(self.region.as_deref())?,
            terminate_after: self.terminate_after,
            delay: self.delay,
        })
    }
}

/// Options steering one composition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposeOptions {
    /// Directory receiving the launch logs.
    pub log_dir: String,
    /// Bootstrap fragment override.
    pub setup: Option<String>,
    /// Tag applied to the running instance.
    pub instance_tag: Option<String>,
    /// Provider region for tagging and self-termination.
    pub region: Option<String>,
    /// Whether to append the self-termination block.
    pub terminate_after: bool,
    /// Optional sleep before the script ends.
    pub delay: Option<u64>,
    /// Fragment family consumed from the mounts.
    pub stage: SetupStage,
}

impl ComposeOptions {
    /// Builds composition options from the host section for the given
    /// stage.
    #[must_use]
    pub fn from_host(host: &HostOptions, stage: SetupStage) -> Self {
        Self {
            log_dir: host.log_dir.clone(),
            setup: host.setup.clone(),
            instance_tag: host.instance_tag.clone(),
            region: host.region.clone(),
            terminate_after: host.terminate_after,
            delay: host.delay,
            stage,
        }
    }

    /// Minimal options for a local composition into `log_dir`.
    #[must_use]
    pub fn local(log_dir: impl Into<String>) -> Self {
        Self {
            log_dir: log_dir.into(),
            setup: None,
            instance_tag: None,
            region: None,
            terminate_after: false,
            delay: None,
            stage: SetupStage::Remote,
        }
    }
}

/// The fully composed launch script. Built once per run, immutable once
/// assembled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchScript(String);

impl LaunchScript {
    /// Returns the script text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the script, returning the owned text.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for LaunchScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composes the launch script from the mount set, the runner, and the
/// options.
///
/// # Errors
///
/// Returns [`ConfigError::MissingRegion`] when tagging or
/// self-termination is requested without a region, and
/// [`ConfigError::TagTooLong`] when the instance tag exceeds the
/// provider limit.
pub fn compose(
    mounts: &[Mount],
    runner: &Runner,
    options: &ComposeOptions,
) -> Result<LaunchScript, ConfigError> {
    validate(options)?;

    let log_dir = options.log_dir.trim_end_matches('/');
    let log_path = format!("{log_dir}/{LAUNCH_LOG_FILE}");
    let error_path = format!("{log_dir}/{LAUNCH_ERROR_LOG_FILE}");

    let mut body: Vec<String> = Vec::new();
    body.push(format!("truncate -s 0 {log_path}"));
    body.push(format!("truncate -s 0 {error_path}"));
    if let Some(setup) = bootstrap(options) {
        body.push(setup);
    }
    if let Some(tag) = &options.instance_tag {
        let region = options.region.as_deref().unwrap_or_default();
        body.push(tag_instance_block(tag, region));
    }
    for mount in mounts {
        let fragment = match options.stage {
            SetupStage::Remote => &mount.remote_setup,
            SetupStage::Host => &mount.host_setup,
        };
        push_fragment(&mut body, fragment);
    }
    for mount in mounts {
        push_fragment(&mut body, &mount.upload_script);
    }
    push_fragment(&mut body, &runner.setup_script);
    push_fragment(&mut body, &runner.run_script);
    push_fragment(&mut body, &runner.post_script);
    if let Some(delay) = options.delay {
        body.push(format!("sleep {delay}"));
    }
    if options.terminate_after {
        body.push(terminate_block(options.region.as_deref().unwrap_or_default()));
    }

    let mut script = String::new();
    script.push_str("#!/bin/bash\n");
    script.push_str("# to allow process substitution\n");
    script.push_str("set +o posix\n");
    script.push_str(&format!("mkdir -p {log_dir}\n"));
    if options.stage == SetupStage::Host {
        script.push_str(&format!("SKIFF_LOG_DIR={log_dir}\n"));
    }
    script.push_str("{\n");
    script.push_str(&body.join("\n"));
    script.push('\n');
    script.push_str(&format!(
        "}} > >(tee -a {log_path}) 2> >(tee -a {error_path} >&2)\n"
    ));
    Ok(LaunchScript(script))
}

fn validate(options: &ComposeOptions) -> Result<(), ConfigError> {
    if let Some(tag) = &options.instance_tag {
        let length = tag.chars().count();
        if length > MAX_INSTANCE_TAG_LENGTH {
            return Err(ConfigError::TagTooLong { length });
        }
        if options.region.is_none() {
            return Err(ConfigError::MissingRegion {
                feature: "instance_tag",
            });
        }
    }
    if options.terminate_after && options.region.is_none() {
        return Err(ConfigError::MissingRegion {
            feature: "terminate_after",
        });
    }
    Ok(())
}

fn bootstrap(options: &ComposeOptions) -> Option<String> {
    match (&options.setup, options.stage) {
        (Some(setup), _) => {
            let trimmed = setup.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        }
        (None, SetupStage::Host) => Some(AWS_CLI_BOOTSTRAP.to_owned()),
        (None, SetupStage::Remote) => None,
    }
}

fn push_fragment(body: &mut Vec<String>, fragment: &str) {
    let trimmed = fragment.trim();
    if !trimmed.is_empty() {
        body.push(trimmed.to_owned());
    }
}

fn tag_instance_block(tag: &str, region: &str) -> String {
    format!(
        concat!(
            "if [ \"$(cat /sys/devices/virtual/dmi/id/bios_version 2>/dev/null)\" = \"1.0\" ] ||\n",
            "   {{ [ -f /sys/hypervisor/uuid ] && [ \"$(head -c 3 /sys/hypervisor/uuid)\" = \"ec2\" ]; }}; then\n",
            "    echo \"tagging EC2 instance\"\n",
            "    EC2_INSTANCE_ID=\"$(wget -q -O - http://169.254.169.254/latest/meta-data/instance-id)\"\n",
            "    aws ec2 create-tags --resources \"$EC2_INSTANCE_ID\" --tags 'Key=Name,Value={tag}' --region {region}\n",
            "fi"
        ),
        tag = tag,
        region = region,
    )
}

fn terminate_block(region: &str) -> String {
    format!(
        concat!(
            "EC2_INSTANCE_ID=\"$(wget -q -O - http://169.254.169.254/latest/meta-data/instance-id)\"\n",
            "aws ec2 terminate-instances --instance-ids \"$EC2_INSTANCE_ID\" --region {region}"
        ),
        region = region,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> Runner {
        Runner {
            setup_script: String::from("echo setup"),
            run_script: String::from("echo run"),
            post_script: String::new(),
        }
    }

    fn tag_options(tag: &str, region: Option<&str>) -> ComposeOptions {
        ComposeOptions {
            instance_tag: Some(tag.to_owned()),
            region: region.map(str::to_owned),
            stage: SetupStage::Host,
            ..ComposeOptions::local("/tmp/skiff")
        }
    }

    #[test]
    fn host_stage_defaults_to_the_aws_cli_bootstrap() {
        let options = ComposeOptions {
            stage: SetupStage::Host,
            ..ComposeOptions::local("/tmp/skiff")
        };
        let script = compose(&[], &runner(), &options)
            .unwrap_or_else(|err| panic!("compose: {err}"));
        assert!(script.as_str().contains("pip install awscli"));
    }

    #[test]
    fn explicit_empty_setup_disables_the_bootstrap() {
        let options = ComposeOptions {
            setup: Some(String::new()),
            stage: SetupStage::Host,
            ..ComposeOptions::local("/tmp/skiff")
        };
        let script = compose(&[], &runner(), &options)
            .unwrap_or_else(|err| panic!("compose: {err}"));
        assert!(!script.as_str().contains("pip install awscli"));
    }

    #[test]
    fn local_stage_has_no_bootstrap() {
        let script = compose(&[], &runner(), &ComposeOptions::local("/tmp/skiff"))
            .unwrap_or_else(|err| panic!("compose: {err}"));
        assert!(!script.as_str().contains("pip install awscli"));
    }

    #[test]
    fn only_host_scripts_export_the_log_dir() {
        let host = ComposeOptions {
            stage: SetupStage::Host,
            ..ComposeOptions::local("/tmp/skiff")
        };
        let host_script =
            compose(&[], &runner(), &host).unwrap_or_else(|err| panic!("compose: {err}"));
        assert!(host_script.as_str().contains("SKIFF_LOG_DIR=/tmp/skiff"));

        let local_script = compose(&[], &runner(), &ComposeOptions::local("/tmp/skiff"))
            .unwrap_or_else(|err| panic!("compose: {err}"));
        assert!(!local_script.as_str().contains("SKIFF_LOG_DIR"));
    }

    #[test]
    fn tag_without_region_fails() {
        let err = compose(&[], &runner(), &tag_options("exp-1", None))
            .expect_err("tag without region should fail");
        assert!(matches!(
            err,
            ConfigError::MissingRegion {
                feature: "instance_tag"
            }
        ));
    }

    #[test]
    fn terminate_without_region_fails() {
        let options = ComposeOptions {
            terminate_after: true,
            stage: SetupStage::Host,
            ..ComposeOptions::local("/tmp/skiff")
        };
        let err = compose(&[], &runner(), &options)
            .expect_err("terminate without region should fail");
        assert!(matches!(
            err,
            ConfigError::MissingRegion {
                feature: "terminate_after"
            }
        ));
    }

    #[test]
    fn terminate_block_follows_the_optional_sleep() {
        let options = ComposeOptions {
            region: Some(String::from("us-west-2")),
            terminate_after: true,
            delay: Some(300),
            stage: SetupStage::Host,
            ..ComposeOptions::local("/tmp/skiff")
        };
        let script = compose(&[], &runner(), &options)
            .unwrap_or_else(|err| panic!("compose: {err}"));
        let text = script.as_str();
        let sleep_at = text.find("sleep 300").unwrap_or_else(|| panic!("sleep"));
        let terminate_at = text
            .find("aws ec2 terminate-instances")
            .unwrap_or_else(|| panic!("terminate"));
        assert!(sleep_at < terminate_at);
        assert!(text.contains("--region us-west-2"));
    }

    #[test]
    fn tag_block_requires_metadata_lookup() {
        let script = compose(&[], &runner(), &tag_options("exp-1", Some("us-west-2")))
            .unwrap_or_else(|err| panic!("compose: {err}"));
        let text = script.as_str();
        assert!(text.contains("http://169.254.169.254/latest/meta-data/instance-id"));
        assert!(text.contains("'Key=Name,Value=exp-1'"));
    }
}
