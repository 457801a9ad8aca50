//! Layered configuration resolution.
//!
//! A project configuration is a YAML mapping with a `run` section of
//! default settings, a `modes` mapping of named override sets, a
//! `mounts` list, and nested `runner`/`host`/`launch` sections. Resolving
//! merges, in a fixed order: the root mapping, the `run` section or the
//! selected mode, and finally any call-site overrides. The nested
//! `runner`/`host`/`launch` mappings merge shallowly: an override key
//! replaces the same key inside the section, unspecified keys survive.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::compose::HostOptions;
use crate::launch::LaunchSpec;
use crate::mount::MountSpec;
use crate::runner::RunnerSpec;

/// Top-level key holding the default override section.
pub const RUN_SECTION: &str = "run";
/// Top-level key holding the named mode override sets.
pub const MODES_SECTION: &str = "modes";

/// Errors raised while locating, parsing, or resolving configuration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when no configuration file exists in the working directory
    /// or any of its ancestors.
    #[error("`{file_name}` not found in the working directory or any parent; run `skiff init` to create one")]
    NotFound {
        /// File name that was searched for.
        file_name: String,
    },
    /// Raised when file system access to the configuration fails.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when YAML parsing or typed extraction fails.
    #[error("configuration parsing failed: {message}")]
    Parse {
        /// Underlying parser message.
        message: String,
    },
    /// Raised when the document shape is not what the loader expects.
    #[error("invalid configuration: {message}")]
    InvalidStructure {
        /// Description of the structural problem.
        message: String,
    },
    /// Raised when the requested mode has no entry under `modes`.
    #[error("unknown mode `{mode}`: no such entry under `modes`")]
    UnknownMode {
        /// Mode name passed by the caller.
        mode: String,
    },
    /// Raised when a required section is absent after merging.
    #[error("missing required `{section}` section in configuration")]
    MissingSection {
        /// Section name (`runner` or `launch`).
        section: &'static str,
    },
    /// Raised when a template references a name the context cannot
    /// supply.
    #[error("unresolved placeholder `{{{placeholder}}}` in configuration template")]
    UnresolvedPlaceholder {
        /// Placeholder name that failed to resolve.
        placeholder: String,
    },
    /// Raised when a `{now:..}` placeholder carries a bad strftime spec.
    #[error("invalid timestamp format `{spec}`")]
    InvalidTimestampFormat {
        /// Offending format spec.
        spec: String,
    },
    /// Raised when the instance tag exceeds the provider limit.
    #[error("instance tag is {length} characters; the provider limit is 128")]
    TagTooLong {
        /// Character count of the offending tag.
        length: usize,
    },
    /// Raised when a host feature needs a region that was not supplied.
    #[error("`{feature}` requires `region` in the host section")]
    MissingRegion {
        /// Feature that triggered the requirement.
        feature: &'static str,
    },
    /// Raised when a configuration file already exists and overwrite was
    /// not forced.
    #[error("configuration already exists at {path}; rerun with --force to replace it")]
    AlreadyInitialized {
        /// Path of the existing file.
        path: Utf8PathBuf,
    },
}

/// Call-site overrides applied as the last configuration layer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Overrides {
    /// Keys merged into the `runner` section.
    pub runner: Option<Mapping>,
    /// Keys merged into the `host` section.
    pub host: Option<Mapping>,
    /// Keys merged into the `launch` section.
    pub launch: Option<Mapping>,
    /// Extra values exposed to string interpolation.
    pub extras: BTreeMap<String, String>,
}

/// Immutable snapshot produced by [`resolve`].
#[derive(Clone, Debug, PartialEq)]
pub struct EffectiveConfig {
    /// Runner selected for this session, settings still in template form.
    pub runner: RunnerSpec,
    /// Host-script options (log directory, tagging, self-termination).
    pub host: HostOptions,
    /// Backend selection and its settings.
    pub launch: LaunchSpec,
    /// Mount specifications, fixed at resolve time.
    pub mounts: Vec<MountSpec>,
    /// Whether to log intermediate commands and the final script.
    pub verbose: bool,
    /// Root-level string scalars, exposed to string interpolation.
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawSections {
    runner: Option<RunnerSpec>,
    host: Option<HostOptions>,
    launch: Option<LaunchSpec>,
    mounts: Option<Vec<MountSpec>>,
    verbose: Option<bool>,
}

/// Resolves an effective configuration from the raw document.
///
/// With no mode the base `run` section applies (the document is used
/// unchanged when the section is absent). With a mode name the matching
/// entry under `modes` applies instead. The merge order is deterministic
/// so that repeated resolves produce identical snapshots.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownMode`] for a mode without an entry,
/// [`ConfigError::MissingSection`] when `runner` or `launch` is absent
/// after merging, and [`ConfigError::Parse`] when typed extraction
/// fails.
pub fn resolve(
    raw: &Mapping,
    mode: Option<&str>,
    overrides: &Overrides,
) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = raw.clone();

    match mode {
        None => {
            if let Some(section) = raw.get(RUN_SECTION) {
                merge_layer(&mut merged, as_mapping(section, RUN_SECTION)?);
            }
        }
        Some(name) => {
            let layer = raw
                .get(MODES_SECTION)
                .map(|value| as_mapping(value, MODES_SECTION))
                .transpose()?
                .and_then(|modes| modes.get(name))
                .ok_or_else(|| ConfigError::UnknownMode {
                    mode: name.to_owned(),
                })?;
            merge_layer(&mut merged, as_mapping(layer, name)?);
        }
    }

    apply_override(&mut merged, "runner", overrides.runner.as_ref());
    apply_override(&mut merged, "host", overrides.host.as_ref());
    apply_override(&mut merged, "launch", overrides.launch.as_ref());

    effective_from(&merged)
}

/// Merges `layer` into `base`: nested mappings are updated key-by-key,
/// every other value replaces the base entry wholesale.
fn merge_layer(base: &mut Mapping, layer: &Mapping) {
    for (key, value) in layer {
        match (base.get_mut(key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                for (nested_key, nested_value) in incoming {
                    existing.insert(nested_key.clone(), nested_value.clone());
                }
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn apply_override(merged: &mut Mapping, section: &str, layer: Option<&Mapping>) {
    let Some(layer) = layer else {
        return;
    };
    let mut wrapper = Mapping::new();
    wrapper.insert(
        Value::String(section.to_owned()),
        Value::Mapping(layer.clone()),
    );
    merge_layer(merged, &wrapper);
}

fn as_mapping<'a>(value: &'a Value, name: &str) -> Result<&'a Mapping, ConfigError> {
    value
        .as_mapping()
        .ok_or_else(|| ConfigError::InvalidStructure {
            message: format!("`{name}` must be a mapping"),
        })
}

fn effective_from(merged: &Mapping) -> Result<EffectiveConfig, ConfigError> {
    let sections: RawSections = serde_yaml::from_value(Value::Mapping(merged.clone()))
        .map_err(|err| ConfigError::Parse {
            message: err.to_string(),
        })?;
    let runner = sections
        .runner
        .ok_or(ConfigError::MissingSection { section: "runner" })?;
    let launch = sections
        .launch
        .ok_or(ConfigError::MissingSection { section: "launch" })?;
    Ok(EffectiveConfig {
        runner,
        host: sections.host.unwrap_or_default(),
        launch,
        mounts: sections.mounts.unwrap_or_default(),
        verbose: sections.verbose.unwrap_or(false),
        vars: root_string_vars(merged),
    })
}

fn root_string_vars(merged: &Mapping) -> BTreeMap<String, String> {
    const RESERVED: [&str; 7] = [
        RUN_SECTION,
        MODES_SECTION,
        "mounts",
        "runner",
        "host",
        "launch",
        "verbose",
    ];
    let mut vars = BTreeMap::new();
    for (key, value) in merged {
        let (Value::String(name), Value::String(text)) = (key, value) else {
            continue;
        };
        if RESERVED.contains(&name.as_str()) {
            continue;
        }
        vars.insert(name.clone(), text.clone());
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::parse_config;

    const BASE_CONFIG: &str = "
project: demo
runner:
  type: process
  work_dir: /base
launch:
  type: local
run:
  host:
    log_dir: /tmp/base
modes:
  remote:
    launch:
      type: ssh
      ip: 192.0.2.7
      username: ubuntu
";

    fn raw() -> Mapping {
        parse_config(BASE_CONFIG).unwrap_or_else(|err| panic!("parse: {err}"))
    }

    #[test]
    fn no_mode_applies_run_section() {
        let config = resolve(&raw(), None, &Overrides::default())
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert_eq!(config.host.log_dir, "/tmp/base");
        assert!(matches!(config.launch, LaunchSpec::Local(_)));
    }

    #[test]
    fn unknown_mode_is_an_error() {
        let err = resolve(&raw(), Some("nope"), &Overrides::default())
            .expect_err("unknown mode should fail");
        assert!(matches!(err, ConfigError::UnknownMode { ref mode } if mode == "nope"));
    }

    #[test]
    fn mode_layer_merges_nested_sections_shallowly() {
        let config = resolve(&raw(), Some("remote"), &Overrides::default())
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        let LaunchSpec::Ssh(ssh) = &config.launch else {
            panic!("remote mode should select the ssh backend");
        };
        assert_eq!(ssh.ip, "192.0.2.7");
        // The runner section is untouched by the mode layer.
        let RunnerSpec::Process(process) = &config.runner else {
            panic!("runner should still be the process runner");
        };
        assert_eq!(process.work_dir, "/base");
    }

    #[test]
    fn call_site_override_replaces_single_keys() {
        let overrides = Overrides {
            runner: Some(
                serde_yaml::from_str("work_dir: /override")
                    .unwrap_or_else(|err| panic!("yaml: {err}")),
            ),
            ..Overrides::default()
        };
        let config =
            resolve(&raw(), None, &overrides).unwrap_or_else(|err| panic!("resolve: {err}"));
        let RunnerSpec::Process(process) = &config.runner else {
            panic!("runner should be the process runner");
        };
        assert_eq!(process.work_dir, "/override");
    }

    #[test]
    fn missing_runner_section_is_fatal() {
        let raw = parse_config("launch:\n  type: local\n")
            .unwrap_or_else(|err| panic!("parse: {err}"));
        let err = resolve(&raw, None, &Overrides::default())
            .expect_err("missing runner should fail");
        assert!(matches!(err, ConfigError::MissingSection { section: "runner" }));
    }

    #[test]
    fn missing_launch_section_is_fatal() {
        let raw = parse_config("runner:\n  type: process\n")
            .unwrap_or_else(|err| panic!("parse: {err}"));
        let err = resolve(&raw, None, &Overrides::default())
            .expect_err("missing launch should fail");
        assert!(matches!(err, ConfigError::MissingSection { section: "launch" }));
    }

    #[test]
    fn root_string_scalars_become_vars() {
        let config = resolve(&raw(), None, &Overrides::default())
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert_eq!(config.vars.get("project").map(String::as_str), Some("demo"));
        assert!(!config.vars.contains_key("runner"));
    }
}
