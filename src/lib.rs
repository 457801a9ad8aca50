//! Core library for the Skiff launch tool.
//!
//! Skiff composes a shell launch script from configurable fragments
//! (mount setup and upload steps, runner setup/run/post commands, log
//! capture, optional instance self-tagging and self-termination) and
//! ships it to one of three backends: the local machine, an SSH host, or
//! a freshly provisioned EC2 instance (on-demand or spot).

pub mod compose;
pub mod config;
pub mod context;
pub mod discovery;
pub mod exec;
pub mod launch;
pub mod listen;
pub mod mount;
pub mod runner;
pub mod session;

pub use compose::{ComposeOptions, HostOptions, LaunchScript, SetupStage, compose};
pub use config::{ConfigError, EffectiveConfig, Overrides, resolve};
pub use context::Context;
pub use exec::{CommandOutput, CommandRunner, ProcessCommandRunner, TransportError};
pub use launch::{
    AwsEc2Launcher, DispatchOptions, Dispatcher, DryRunReport, Ec2Launch, InstanceDescriptor,
    InstanceLauncher, LaunchError, LaunchHandle, LaunchSpec, LocalLaunch, ProviderError,
    ProviderFuture, SshLaunch,
};
pub use mount::{Mount, MountSpec};
pub use runner::{Runner, RunnerSpec};
pub use session::{LaunchRequest, Session};
