//! Command-line interface definitions for the `vessel` binary.
//!
//! The parser structures live here so the binary and the build script can
//! share them when generating the manual page.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `vessel` binary.
#[derive(Debug, Parser)]
#[command(
    name = "vessel",
    version,
    about = "Edit locally, run remotely: ephemeral development environments on Fly.io",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log progress and print full error chains.
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    /// Project configuration file.
    #[arg(
        short = 'c',
        long = "config-file",
        global = true,
        value_name = "PATH",
        default_value = "vessel.yml"
    )]
    pub(crate) config_file: PathBuf,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Lifecycle and access subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Provision a new environment for this project.
    #[command(about = "Provision a new environment for this project")]
    Init(InitArgs),
    /// Start file sync and port forwarding.
    #[command(about = "Start file sync and port forwarding")]
    Start(StartArgs),
    /// Stop file sync and port forwarding.
    #[command(about = "Stop file sync and port forwarding; the machine keeps running")]
    Stop,
    /// Delete the environment and its local state.
    #[command(about = "Delete the environment and its local state")]
    Destroy(DestroyArgs),
    /// Run a command in the remote project directory.
    #[command(about = "Run a command in the remote project directory")]
    Cmd(CmdArgs),
    /// Open an interactive shell in the remote project directory.
    #[command(about = "Open an interactive shell in the remote project directory")]
    Ssh,
    /// Validate a Fly.io token and store it with an organisation.
    #[command(about = "Validate a Fly.io access token and store it for later commands")]
    Auth(AuthArgs),
    /// Open the first forwarded port in the browser.
    #[command(about = "Open the first forwarded port in the local browser")]
    Open,
}

/// Arguments for `vessel auth`.
#[derive(Debug, Args)]
pub(crate) struct AuthArgs {
    /// Access token; defaults to the one `flyctl auth login` stored.
    #[arg(short, long, value_name = "TOKEN")]
    pub(crate) token: Option<String>,
    /// Organisation slug; defaults to the personal organisation.
    #[arg(short, long, value_name = "SLUG")]
    pub(crate) org: Option<String>,
}

/// Arguments for `vessel init`.
#[derive(Debug, Args)]
pub(crate) struct InitArgs {
    /// Application name; defaults to the current directory's name.
    #[arg(short, long, value_name = "NAME")]
    pub(crate) name: Option<String>,
    /// Allocate an IPv4 address instead of IPv6.
    #[arg(short = '4', long = "ipv4")]
    pub(crate) ipv4: bool,
}

/// Arguments for `vessel start`.
#[derive(Debug, Args)]
pub(crate) struct StartArgs {
    /// Return once sessions are running instead of waiting for Ctrl-C.
    #[arg(short, long)]
    pub(crate) detach: bool,
}

/// Arguments for `vessel destroy`.
#[derive(Debug, Args)]
pub(crate) struct DestroyArgs {
    /// Only remove local files; leave the remote application running.
    #[arg(long)]
    pub(crate) files_only: bool,
    /// Skip the confirmation prompt.
    #[arg(short, long)]
    pub(crate) quit: bool,
}

/// Arguments for `vessel cmd`.
#[derive(Debug, Args)]
pub(crate) struct CmdArgs {
    /// Command to execute remotely (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) command: Vec<String>,
}
