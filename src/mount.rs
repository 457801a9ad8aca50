//! Mount specifications and their resolved script fragments.
//!
//! A mount is a unit of local content with instructions for how it
//! reaches the execution target. Specifications are tagged by `type` in
//! configuration; resolving one against the interpolation context yields
//! an immutable [`Mount`] whose fields are shell fragments consumed by
//! the script composer. An absent fragment is the empty string and
//! contributes nothing to the composed script.

use camino::Utf8Path;
use serde::Deserialize;
use shell_escape::unix::escape;

use crate::config::ConfigError;
use crate::context::Context;

const ARCHIVE_STAGING_DIR: &str = "/tmp/skiff-archives";

/// Mount specification as written in configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MountSpec {
    /// Code or data shipped through an S3 bucket: archived and uploaded
    /// locally, fetched and unpacked on the target.
    S3 {
        /// Local directory to archive.
        local_path: String,
        /// Bucket prefix the archive is uploaded under, e.g.
        /// `s3://bucket/path`.
        prefix: String,
        /// Directory on the target the archive is unpacked into.
        remote_path: String,
        /// Bind path inside the container; defaults to `remote_path`.
        #[serde(default)]
        container_path: Option<String>,
        /// Whether this mount contributes to the Python path.
        #[serde(default)]
        pypath: bool,
        /// Whether to gzip the archive.
        #[serde(default = "default_true")]
        compress: bool,
    },
    /// A directory that already exists on the target host, exposed to
    /// the container as a bind mount.
    Host {
        /// Directory on the host.
        host_path: String,
        /// Bind path inside the container.
        container_path: String,
        /// Whether this mount contributes to the Python path.
        #[serde(default)]
        pypath: bool,
    },
    /// An output directory on the target, synced back to S3 by a
    /// background loop for the lifetime of the run.
    Output {
        /// Directory on the target that collects results.
        remote_path: String,
        /// Bucket prefix the results are synced to.
        prefix: String,
        /// Bind path inside the container; defaults to `remote_path`.
        #[serde(default)]
        container_path: Option<String>,
        /// Seconds between sync passes.
        #[serde(default = "default_sync_interval")]
        interval: u64,
    },
}

const fn default_true() -> bool {
    true
}

const fn default_sync_interval() -> u64 {
    15
}

impl MountSpec {
    /// Resolves this specification against the interpolation context.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnresolvedPlaceholder`] when a template
    /// field references a name the context cannot supply.
    pub fn materialize(&self, context: &Context) -> Result<Mount, ConfigError> {
        match self {
            Self::S3 {
                local_path,
                prefix,
                remote_path,
                container_path,
                pypath,
                compress,
            } => {
                let local_path = context.render(local_path)?;
                let prefix = context.render(prefix)?.trim_end_matches('/').to_owned();
                let remote_path = context.render(remote_path)?;
                let container_path = match container_path {
                    Some(path) => context.render(path)?,
                    None => remote_path.clone(),
                };
                Ok(s3_mount(
                    &local_path,
                    &prefix,
                    &remote_path,
                    &container_path,
                    *pypath,
                    *compress,
                    context.run_id(),
                ))
            }
            Self::Host {
                host_path,
                container_path,
                pypath,
            } => {
                let host_path = context.render(host_path)?;
                let container_path = context.render(container_path)?;
                Ok(Mount {
                    docker_mount: bind_mount(&host_path, &container_path),
                    host_path,
                    container_path,
                    pypath: *pypath,
                    ..Mount::default()
                })
            }
            Self::Output {
                remote_path,
                prefix,
                container_path,
                interval,
            } => {
                let remote_path = context.render(remote_path)?;
                let prefix = context.render(prefix)?.trim_end_matches('/').to_owned();
                let container_path = match container_path {
                    Some(path) => context.render(path)?,
                    None => remote_path.clone(),
                };
                Ok(output_mount(&remote_path, &prefix, &container_path, *interval))
            }
        }
    }
}

/// Resolved mount: an immutable bundle of shell fragments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mount {
    /// Executed on the launching machine before dispatch (e.g. archive
    /// and upload the code).
    pub local_script: String,
    /// Placed in the launch script after setup (e.g. a background sync
    /// loop pushing results out).
    pub upload_script: String,
    /// Setup fragment used when the script runs directly on the
    /// execution target.
    pub remote_setup: String,
    /// Setup fragment used when the script runs on a provisioned host.
    pub host_setup: String,
    /// Path of the content on the host.
    pub host_path: String,
    /// Path of the content inside the container.
    pub container_path: String,
    /// Whether the mount contributes to the Python path.
    pub pypath: bool,
    /// `-v host:container` argument consumed by the docker runner.
    pub docker_mount: String,
}

fn s3_mount(
    local_path: &str,
    prefix: &str,
    remote_path: &str,
    container_path: &str,
    pypath: bool,
    compress: bool,
    run_id: &str,
) -> Mount {
    let stem = Utf8Path::new(local_path)
        .file_name()
        .unwrap_or("code")
        .to_owned();
    let archive = if compress {
        format!("{stem}-{run_id}.tar.gz")
    } else {
        format!("{stem}-{run_id}.tar")
    };
    let create_flags = if compress { "czf" } else { "cf" };
    let extract_flags = if compress { "zxf" } else { "xf" };

    let staged = format!("{ARCHIVE_STAGING_DIR}/{archive}");
    let local_script = format!(
        "mkdir -p {staging}\ntar {create_flags} {staged} -C {local} .\naws s3 cp {staged} {object}",
        staging = ARCHIVE_STAGING_DIR,
        staged = escape(staged.as_str().into()),
        local = escape(local_path.into()),
        object = escape(format!("{prefix}/{archive}").as_str().into()),
    );
    let fetch = format!(
        "aws s3 cp {object} {fetched}\nmkdir -p {remote}\ntar {extract_flags} {fetched} -C {remote}",
        object = escape(format!("{prefix}/{archive}").as_str().into()),
        fetched = escape(format!("/tmp/{archive}").as_str().into()),
        remote = escape(remote_path.into()),
    );

    Mount {
        local_script,
        remote_setup: fetch.clone(),
        host_setup: fetch,
        host_path: remote_path.to_owned(),
        container_path: container_path.to_owned(),
        pypath,
        docker_mount: bind_mount(remote_path, container_path),
        ..Mount::default()
    }
}

fn output_mount(remote_path: &str, prefix: &str, container_path: &str, interval: u64) -> Mount {
    let setup = format!("mkdir -p {}", escape(remote_path.into()));
    let upload_script = format!(
        "while true; do\n    aws s3 cp --recursive {remote} {prefix} > /dev/null 2>&1\n    sleep {interval}\ndone &",
        remote = escape(remote_path.into()),
        prefix = escape(prefix.into()),
    );
    Mount {
        upload_script,
        remote_setup: setup.clone(),
        host_setup: setup,
        host_path: remote_path.to_owned(),
        container_path: container_path.to_owned(),
        docker_mount: bind_mount(remote_path, container_path),
        ..Mount::default()
    }
}

fn bind_mount(host_path: &str, container_path: &str) -> String {
    format!(
        "-v {}:{}",
        escape(host_path.into()),
        escape(container_path.into())
    )
}

/// Colon-joined host and container Python paths contributed by the
/// mounts flagged `pypath`, in mount order.
#[must_use]
pub fn pypath_strings(mounts: &[Mount]) -> (String, String) {
    let host = mounts
        .iter()
        .filter(|mount| mount.pypath && !mount.host_path.is_empty())
        .map(|mount| mount.host_path.as_str())
        .collect::<Vec<_>>()
        .join(":");
    let container = mounts
        .iter()
        .filter(|mount| mount.pypath && !mount.container_path.is_empty())
        .map(|mount| mount.container_path.as_str())
        .collect::<Vec<_>>()
        .join(":");
    (host, container)
}

/// Space-joined docker bind-mount arguments, in mount order.
#[must_use]
pub fn docker_mount_string(mounts: &[Mount]) -> String {
    mounts
        .iter()
        .filter(|mount| !mount.docker_mount.is_empty())
        .map(|mount| mount.docker_mount.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}
