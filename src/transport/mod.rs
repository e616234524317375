//! Authenticated remote shell access to an environment.
//!
//! The local `ssh` client does the heavy lifting. A connection attempt is
//! split into stages so callers can tell a network problem from a rejected
//! key: a bounded TCP dial, then a batch-mode `ssh ... true` check.
//!
//! [`CommandRunner`] is synchronous, so captured and attached client runs
//! are moved onto tokio's blocking pool.

mod error;

use std::ffi::OsString;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use shell_escape::unix::escape;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::task;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::process::{CommandOutput, CommandRunner, ProcessError};
use crate::project::{ProjectConfig, RemoteConfig};

pub use error::{ConnectionError, ConnectionStage, TransportError};

/// Default SSH client executable.
pub const SSH_PROGRAM: &str = "ssh";

/// Exit status reported when an interactive session is ended with Ctrl+C.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Exit status the SSH client uses for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

const AUTH_FAILURE_MARKERS: [&str; 3] = [
    "permission denied",
    "authentication failed",
    "too many authentication failures",
];

/// Settings for the local SSH client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransportSettings {
    /// SSH client executable.
    pub program: String,
    /// Bound on the TCP dial and the client's own connect phase.
    pub connect_timeout: Duration,
}

impl TransportSettings {
    /// Creates settings for the default `ssh` client.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            program: SSH_PROGRAM.to_owned(),
            connect_timeout,
        }
    }

    /// Overrides the client executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

/// Runs commands and shells on the machine an environment descriptor names.
#[derive(Clone, Debug)]
pub struct RemoteShell<R: CommandRunner> {
    runner: R,
    settings: TransportSettings,
}

impl<R> RemoteShell<R>
where
    R: CommandRunner + Clone + Send + 'static,
{
    /// Creates a transport using `runner` for captured SSH invocations.
    #[must_use]
    pub const fn new(runner: R, settings: TransportSettings) -> Self {
        Self { runner, settings }
    }

    /// Returns the client settings.
    #[must_use]
    pub const fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Dials and authenticates without running any work.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] tagged with the stage that failed.
    pub async fn connect(&self, descriptor: &ProjectConfig) -> Result<(), ConnectionError> {
        let remote = &descriptor.remote;
        self.dial(remote).await?;
        debug!(host = %describe(remote), "dial succeeded");

        let mut args = self.connection_args(remote, true);
        args.push(OsString::from("true"));
        let output = self
            .run_blocking(args, false)
            .await
            .map_err(|err| connection_error(ConnectionStage::OpenSession, remote, err.to_string()))?;
        if output.is_success() {
            return Ok(());
        }
        Err(classify_check_failure(remote, &output))
    }

    /// Returns `true` when the environment accepts a connection.
    ///
    /// Used as a readiness check; nothing runs on the remote side.
    pub async fn test_connection(&self, descriptor: &ProjectConfig) -> bool {
        match self.connect(descriptor).await {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "connection check failed");
                false
            }
        }
    }

    /// Runs `command` in the environment's remote path with the caller's
    /// streams attached, returning the remote exit status.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidCommand`] for arguments with control
    /// characters, [`TransportError::Connection`] when the connection fails,
    /// and [`TransportError::Terminated`] when no exit status is reported.
    pub async fn run_command(
        &self,
        descriptor: &ProjectConfig,
        command: &[String],
    ) -> Result<i32, TransportError> {
        validate_command(command)?;
        self.connect(descriptor).await?;

        let remote = &descriptor.remote;
        let mut args = self.connection_args(remote, false);
        args.push(OsString::from(in_remote_path(remote, &render_command(command))));
        info!(host = %describe(remote), "running remote command");

        let output = self.run_blocking(args, true).await?;
        match output.code {
            Some(SSH_CLIENT_FAILURE) => Err(connection_error(
                ConnectionStage::OpenSession,
                remote,
                failure_text(&output),
            )
            .into()),
            Some(code) => Ok(code),
            None => Err(TransportError::Terminated),
        }
    }

    /// Opens an interactive login shell in the remote path.
    ///
    /// The session ends when the remote shell exits or when `cancel`
    /// resolves, in which case the client is killed and the connection
    /// closes. An exit caused by an interrupt counts as clean.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] when the connection fails and
    /// [`TransportError::Exited`] for a failing shell exit status.
    pub async fn run_interactive<C>(
        &self,
        descriptor: &ProjectConfig,
        cancel: C,
    ) -> Result<(), TransportError>
    where
        C: Future<Output = ()>,
    {
        self.connect(descriptor).await?;

        let remote = &descriptor.remote;
        let mut args = self.connection_args(remote, false);
        args.insert(0, OsString::from("-tt"));
        args.push(OsString::from(in_remote_path(remote, "exec \"$SHELL\" -l")));

        let mut child = Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                connection_error(ConnectionStage::OpenSession, remote, err.to_string())
            })?;

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel => None,
        };

        let Some(waited) = finished else {
            info!(host = %describe(remote), "cancelling interactive session");
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to stop SSH client");
            }
            return Ok(());
        };

        let status = waited.map_err(|err| {
            connection_error(ConnectionStage::OpenSession, remote, err.to_string())
        })?;
        match status.code() {
            Some(0 | INTERRUPTED_EXIT_CODE) => Ok(()),
            Some(SSH_CLIENT_FAILURE) => Err(connection_error(
                ConnectionStage::OpenSession,
                remote,
                String::from("SSH client exited with status 255"),
            )
            .into()),
            Some(code) => Err(TransportError::Exited { code }),
            None => Err(TransportError::Terminated),
        }
    }

    async fn run_blocking(
        &self,
        args: Vec<OsString>,
        attached: bool,
    ) -> Result<CommandOutput, ProcessError> {
        let runner = self.runner.clone();
        let program = self.settings.program.clone();
        let joined = task::spawn_blocking(move || {
            if attached {
                runner.run_attached(&program, &args)
            } else {
                runner.run(&program, &args)
            }
        })
        .await;
        joined.unwrap_or_else(|err| {
            Err(ProcessError::Wait {
                program: self.settings.program.clone(),
                message: err.to_string(),
            })
        })
    }

    async fn dial(&self, remote: &RemoteConfig) -> Result<(), ConnectionError> {
        let address = (remote.hostname.as_str(), remote.port);
        match timeout(self.settings.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(err)) => Err(connection_error(ConnectionStage::Dial, remote, err.to_string())),
            Err(_) => Err(connection_error(
                ConnectionStage::Dial,
                remote,
                format!(
                    "no answer within {}s",
                    self.settings.connect_timeout.as_secs()
                ),
            )),
        }
    }

    fn connection_args(&self, remote: &RemoteConfig, batch: bool) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            OsString::from("-i"),
            OsString::from(&remote.identityfile),
            OsString::from("-p"),
            OsString::from(remote.port.to_string()),
            OsString::from("-o"),
            OsString::from("IdentitiesOnly=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.settings.connect_timeout.as_secs().max(1)
            )),
        ];
        if batch {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }
        args.push(OsString::from(format!("{}@{}", remote.user, remote.hostname)));
        args
    }
}

fn describe(remote: &RemoteConfig) -> String {
    format!("{}@{}:{}", remote.user, remote.hostname, remote.port)
}

fn connection_error(stage: ConnectionStage, remote: &RemoteConfig, message: String) -> ConnectionError {
    ConnectionError {
        stage,
        target: describe(remote),
        message,
    }
}

fn failure_text(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("SSH client exited with status {}", output.status_text())
    } else {
        stderr.to_owned()
    }
}

fn classify_check_failure(remote: &RemoteConfig, output: &CommandOutput) -> ConnectionError {
    let message = failure_text(output);
    let lowered = message.to_lowercase();
    let stage = if output.code == Some(SSH_CLIENT_FAILURE)
        && AUTH_FAILURE_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
    {
        ConnectionStage::Authenticate
    } else {
        ConnectionStage::OpenSession
    };
    connection_error(stage, remote, message)
}

fn in_remote_path(remote: &RemoteConfig, command: &str) -> String {
    let escaped_path = escape(remote.path.as_str().into());
    format!("cd {escaped_path} && {command}")
}

/// Joins arguments into one shell command line, escaping each.
#[must_use]
pub fn render_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rejects arguments that would smuggle control characters to the shell.
///
/// # Errors
///
/// Returns [`TransportError::InvalidCommand`] naming the first offender.
pub fn validate_command(args: &[String]) -> Result<(), TransportError> {
    args.iter()
        .find(|arg| arg.chars().any(char::is_control))
        .map_or(Ok(()), |argument| {
            Err(TransportError::InvalidCommand {
                argument: argument.clone(),
            })
        })
}

#[cfg(test)]
mod tests;
