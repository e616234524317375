//! Binary entry point for the `vessel` CLI.

mod cli;

use std::env;
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tracing::warn;

use vessel::auth::{AuthError, AuthRequest, authenticate};
use vessel::browser::{BrowserError, DEFAULT_OPENER, forwarded_url, open_url};
use vessel::config::{flyctl_config_file, user_config_file};
use vessel::fly::{ApiProxy, PROXY_STARTUP};
use vessel::sync::{ENGINE_VERSION, EngineInstaller};
use vessel::{
    DestroyOutcome, EngineConfig, EnvironmentStore, FlyBackend, HostRegistration, InitOutcome,
    InitRequest, Lifecycle, LifecycleError, LifecycleSettings, ProcessCommandRunner, RemoteShell,
    SessionManager, StartOutcome, TransportSettings, VesselConfig, init_tracing,
};

use cli::{AuthArgs, Cli, Command, DestroyArgs, InitArgs, StartArgs};

type CliLifecycle = Lifecycle<FlyBackend, ProcessCommandRunner, ProcessCommandRunner>;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("could not write to the terminal: {0}")]
    Terminal(#[from] io::Error),
}

impl CliError {
    fn summary(&self) -> String {
        match self {
            Self::Lifecycle(err) => err.summary(),
            Self::Auth(err) if err.is_unauthorized() => String::from(
                "the Fly.io access token was rejected; log in again with `flyctl auth login`",
            ),
            Self::Auth(_) | Self::Browser(_) | Self::Terminal(_) => self.to_string(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let verbose = cli.verbose;

    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            write_error(io::stderr(), &err, verbose);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = VesselConfig::load_without_cli_args().map_err(LifecycleError::from)?;
    let project_file = utf8_path(cli.config_file)?;

    match cli.command {
        Command::Init(args) => {
            config.validate().map_err(LifecycleError::from)?;
            install_engine(&config).await?;
            let lifecycle = build_lifecycle(&config, project_file)?;
            with_api_proxy(&config, run_init(&lifecycle, &args)).await
        }
        Command::Start(args) => {
            install_engine(&config).await?;
            let lifecycle = build_lifecycle(&config, project_file)?;
            run_start(&lifecycle, &args).await
        }
        Command::Stop => {
            let lifecycle = build_lifecycle(&config, project_file)?;
            let stopped = lifecycle.stop()?;
            writeln!(io::stdout(), "Stopped {stopped} session(s)")?;
            Ok(0)
        }
        Command::Destroy(args) => {
            if !args.files_only {
                config.validate().map_err(LifecycleError::from)?;
            }
            let lifecycle = build_lifecycle(&config, project_file)?;
            if args.files_only {
                run_destroy(&lifecycle, &args, io::stdin().lock(), io::stdout()).await
            } else {
                let destroy = run_destroy(&lifecycle, &args, io::stdin().lock(), io::stdout());
                with_api_proxy(&config, destroy).await
            }
        }
        Command::Cmd(args) => {
            let lifecycle = build_lifecycle(&config, project_file)?;
            Ok(lifecycle.run_command(&args.command).await?)
        }
        Command::Ssh => {
            let lifecycle = build_lifecycle(&config, project_file)?;
            lifecycle.open_shell(shutdown_signal()).await?;
            Ok(0)
        }
        Command::Auth(args) => run_auth(&config, args, io::stdout()).await,
        Command::Open => {
            let store =
                EnvironmentStore::from_config(&config, project_file).map_err(LifecycleError::from)?;
            let project = store.read_project().map_err(LifecycleError::from)?;
            let url = forwarded_url(&project).map_err(BrowserError::from)?;
            writeln!(io::stdout(), "Opening {url}")?;
            open_url(&ProcessCommandRunner::default(), DEFAULT_OPENER, &url)?;
            Ok(0)
        }
    }
}

/// Runs `work` with the Machines API proxy available, starting it first when
/// the API host is local and nothing answers there.
async fn with_api_proxy<T>(
    config: &VesselConfig,
    work: impl Future<Output = Result<T, CliError>>,
) -> Result<T, CliError> {
    let proxy = ApiProxy::ensure(&config.api_host, config.flyctl_bin.as_deref(), PROXY_STARTUP)
        .await
        .map_err(LifecycleError::from)?;
    let outcome = work.await;
    if let Some(running) = proxy {
        running.stop().await;
    }
    outcome
}

/// Installs the sync engine into the tools directory when it cannot be
/// found and no explicit path is configured.
async fn install_engine(config: &VesselConfig) -> Result<(), CliError> {
    if config
        .mutagen_bin
        .as_deref()
        .is_some_and(|bin| !bin.trim().is_empty())
    {
        return Ok(());
    }
    let tools = config.tools_dir().map_err(LifecycleError::from)?;
    if EngineConfig::discover(None, Some(tools.as_path())).is_ok() {
        return Ok(());
    }
    writeln!(io::stdout(), "Installing mutagen {ENGINE_VERSION} into {tools}")?;
    EngineInstaller::from_config(config)
        .map_err(LifecycleError::from)?
        .install(ProcessCommandRunner::default())
        .await
        .map_err(LifecycleError::from)?;
    Ok(())
}

async fn run_auth(
    config: &VesselConfig,
    args: AuthArgs,
    mut output: impl Write,
) -> Result<i32, CliError> {
    let request = AuthRequest {
        token: args.token,
        org: args.org,
        flyctl_config: flyctl_config_file().map_err(LifecycleError::from)?,
        target: user_config_file().map_err(LifecycleError::from)?,
    };
    let credentials = authenticate(config, &request).await?;
    writeln!(
        output,
        "Authenticated as {} in organisation {} ({})",
        credentials.email, credentials.org.name, credentials.org.slug
    )?;
    writeln!(output, "Credentials written to {}", credentials.path)?;
    Ok(0)
}

fn build_lifecycle(
    config: &VesselConfig,
    project_file: Utf8PathBuf,
) -> Result<CliLifecycle, LifecycleError> {
    let backend = FlyBackend::new(config).map_err(|err| LifecycleError::Config(Box::new(err)))?;
    let store = EnvironmentStore::from_config(config, project_file)?;
    let fallback = config.tools_dir()?;
    let sessions = EngineConfig::discover(config.mutagen_bin.as_deref(), Some(fallback.as_path())).map(
        |engine| {
            SessionManager::new(
                engine,
                ProcessCommandRunner::with_timeout(config.engine_timeout()),
            )
        },
    );
    let shell = RemoteShell::new(
        ProcessCommandRunner::default(),
        TransportSettings::new(config.ssh_connect_timeout()),
    );
    Ok(Lifecycle::new(
        backend,
        sessions,
        shell,
        store,
        LifecycleSettings::from_config(config),
    ))
}

async fn run_init(lifecycle: &CliLifecycle, args: &InitArgs) -> Result<i32, CliError> {
    let name = match &args.name {
        Some(name) => name.clone(),
        None => default_project_name(&current_dir()?)?,
    };
    let outcome = lifecycle
        .init(&InitRequest {
            name,
            use_ipv6: !args.ipv4,
        })
        .await?;
    write_init_summary(io::stdout(), &outcome)?;
    Ok(0)
}

async fn run_start(lifecycle: &CliLifecycle, args: &StartArgs) -> Result<i32, CliError> {
    let outcome = lifecycle.start(&current_dir()?)?;
    write_start_summary(io::stdout(), &outcome)?;
    if args.detach {
        return Ok(0);
    }

    writeln!(io::stdout(), "Syncing; press Ctrl+C to stop")?;
    let stopped = lifecycle.stop_on(shutdown_signal()).await?;
    writeln!(io::stdout(), "Stopped {stopped} session(s)")?;
    Ok(0)
}

async fn run_destroy(
    lifecycle: &CliLifecycle,
    args: &DestroyArgs,
    input: impl BufRead,
    mut output: impl Write,
) -> Result<i32, CliError> {
    let project = lifecycle.store().read_project().map_err(LifecycleError::from)?;
    if !args.quit
        && !confirm(
            input,
            &mut output,
            "This will permanently delete the dev environment, are you sure?",
        )?
    {
        writeln!(output, "Nothing was deleted")?;
        return Ok(0);
    }

    let outcome = lifecycle.destroy(args.files_only).await?;
    write_destroy_summary(output, &outcome, &project.remote.alias)?;
    Ok(0)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for Ctrl+C; stopping now");
    }
}

fn current_dir() -> Result<Utf8PathBuf, LifecycleError> {
    let cwd = env::current_dir().map_err(|err| LifecycleError::Config(Box::new(err)))?;
    utf8_path(cwd)
}

fn utf8_path(path: std::path::PathBuf) -> Result<Utf8PathBuf, LifecycleError> {
    Utf8PathBuf::from_path_buf(path).map_err(|path| {
        LifecycleError::Config(format!("path {} is not valid UTF-8", path.display()).into())
    })
}

fn default_project_name(cwd: &Utf8Path) -> Result<String, LifecycleError> {
    cwd.file_name().map(str::to_owned).ok_or_else(|| {
        LifecycleError::Config(
            format!("cannot derive a project name from {cwd}; pass --name").into(),
        )
    })
}

fn confirm(mut input: impl BufRead, output: &mut impl Write, question: &str) -> io::Result<bool> {
    write!(output, "{question} [y/N] ")?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn write_init_summary(mut target: impl Write, outcome: &InitOutcome) -> io::Result<()> {
    let remote = &outcome.project.remote;
    writeln!(
        target,
        "Environment {} is {} at {}",
        outcome.project.name, outcome.status, remote.hostname
    )?;
    writeln!(target, "Private key: {}", outcome.keys.private_key)?;
    match &outcome.host_entry {
        HostRegistration::Replaced {
            previous: Some(previous),
        } => writeln!(
            target,
            "Updated `Host {}` in your SSH client configuration (it pointed at {previous})",
            remote.alias
        )?,
        HostRegistration::Kept { hostname } => writeln!(
            target,
            "Warning: `Host {}` in your SSH client configuration is shared with other hosts and \
             still points at {hostname}; update it by hand",
            remote.alias
        )?,
        HostRegistration::Added
        | HostRegistration::Unchanged
        | HostRegistration::Replaced { previous: None } => {}
    }
    writeln!(
        target,
        "Connect with `ssh {}` or `vessel ssh`; run `vessel start` to begin syncing",
        remote.alias
    )
}

fn write_start_summary(mut target: impl Write, outcome: &StartOutcome) -> io::Result<()> {
    writeln!(
        target,
        "Sync session {} running ({})",
        outcome.name, outcome.sessions.sync
    )?;
    for (rule, identifier) in outcome
        .project
        .forwarding
        .iter()
        .zip(&outcome.sessions.forwards)
    {
        writeln!(target, "Forwarding {rule} ({identifier})")?;
    }
    Ok(())
}

fn write_destroy_summary(
    mut target: impl Write,
    outcome: &DestroyOutcome,
    alias: &str,
) -> io::Result<()> {
    if outcome.remote_deleted {
        writeln!(target, "Environment {} deleted", outcome.app_name)?;
    } else {
        writeln!(
            target,
            "Local files for {} deleted; the remote application was left running",
            outcome.app_name
        )?;
    }
    writeln!(
        target,
        "Note: the `Host {alias}` entry is still in your SSH client configuration"
    )
}

fn write_error(mut target: impl Write, err: &CliError, verbose: bool) {
    if !verbose {
        writeln!(target, "Error: {}", err.summary()).ok();
        return;
    }
    writeln!(target, "Error: {err}").ok();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        writeln!(target, "  caused by: {cause}").ok();
        source = cause.source();
    }
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
