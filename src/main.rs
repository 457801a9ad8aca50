//! Binary entry point for the Skiff CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use skiff::{
    ConfigError, Dispatcher, LaunchError, LaunchHandle, LaunchRequest, Overrides, Session,
    discovery, listen,
};

#[derive(Debug, Parser)]
#[command(
    name = "skiff",
    about = "Compose a launch script and ship it to a local, SSH, or EC2 target",
    arg_required_else_help = true
)]
enum Cli {
    #[command(name = "run", about = "Compose the launch script and dispatch it")]
    Run(RunCommand),
    #[command(name = "init", about = "Write a starter skiff.yml into the working directory")]
    Init(InitCommand),
    #[command(name = "listen", about = "Stay attached while a detached remote routine runs")]
    Listen(ListenCommand),
}

#[derive(Debug, Parser)]
struct RunCommand {
    /// Named mode from the `modes` section of skiff.yml.
    #[arg(long, value_name = "MODE")]
    mode: Option<String>,
    /// Print the composed script and commands without executing anything.
    #[arg(long)]
    dry: bool,
    /// Log intermediate commands and the final script.
    #[arg(long)]
    verbose: bool,
    /// Stay attached this many seconds after a detached dispatch.
    #[arg(long, value_name = "SECONDS", conflicts_with = "listen")]
    timeout: Option<u64>,
    /// Stay attached indefinitely after a detached dispatch.
    #[arg(long)]
    listen: bool,
    /// Command to execute on the target (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[derive(Debug, Parser)]
struct InitCommand {
    /// Overwrite an existing skiff.yml.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Parser)]
struct ListenCommand {
    /// Return after this many seconds instead of blocking forever.
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Launch(#[from] LaunchError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            writeln!(io::stderr(), "{err}").ok();
            1
        }
    };
    process::exit(exit_code);
}

fn init_tracing(cli: &Cli) {
    let default_level = match cli {
        Cli::Run(run) if run.verbose => "skiff=debug,info",
        _ => "info",
    };
    let filter = EnvFilter::try_from_env("SKIFF_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(args) => run_command(args).await,
        Cli::Init(args) => init_command(args),
        Cli::Listen(args) => {
            listen::wait(args.timeout.map(Duration::from_secs));
            Ok(0)
        }
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    let mut session = Session::discover()?;
    let dispatcher = Dispatcher::with_process_runner();
    let request = LaunchRequest {
        mode: args.mode,
        command: args.command,
        overrides: Overrides::default(),
        dry: args.dry,
        verbose: args.verbose,
    };
    let handle = session.launch(&dispatcher, &request).await?;
    report_handle(&handle);

    if !args.dry && matches!(handle, LaunchHandle::Detached { .. }) {
        if args.listen {
            listen::wait(None);
        } else if let Some(seconds) = args.timeout {
            listen::wait(Some(Duration::from_secs(seconds)));
        }
    }
    Ok(exit_code_for(&handle))
}

fn init_command(args: InitCommand) -> Result<i32, CliError> {
    let cwd = std::env::current_dir().map_err(|err| {
        CliError::Config(ConfigError::Io {
            path: Utf8PathBuf::from("."),
            message: err.to_string(),
        })
    })?;
    let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(|path| {
        CliError::Config(ConfigError::InvalidStructure {
            message: format!("working directory is not UTF-8: {}", path.display()),
        })
    })?;
    let path = discovery::write_starter_config(&cwd, args.force)?;
    tracing::info!(%path, "wrote starter configuration");
    Ok(0)
}

fn report_handle(handle: &LaunchHandle) {
    let mut stdout = io::stdout();
    match handle {
        LaunchHandle::DryRun(report) => {
            for command in &report.commands {
                writeln!(stdout, "{command}").ok();
            }
            write!(stdout, "{}", report.script).ok();
        }
        LaunchHandle::Completed(output) => {
            write!(stdout, "{}", output.stdout).ok();
            write!(io::stderr(), "{}", output.stderr).ok();
        }
        LaunchHandle::Detached { pid } => {
            tracing::info!(pid = *pid, "launch detached");
        }
        LaunchHandle::Instance(descriptor) => {
            for id in &descriptor.instance_ids {
                writeln!(stdout, "{id}").ok();
            }
        }
        LaunchHandle::SpotRequest(request_id) => {
            writeln!(stdout, "{request_id}").ok();
        }
    }
}

fn exit_code_for(handle: &LaunchHandle) -> i32 {
    match handle {
        LaunchHandle::Completed(output) => output.code.unwrap_or(0),
        _ => 0,
    }
}
