//! External command execution with bounded runtime.
//!
//! The sync engine and the SSH client are both driven as subprocesses
//! through [`CommandRunner`], so tests can substitute scripted runners for
//! real processes.

use std::ffi::OsString;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

/// Default upper bound for a single captured command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit code for error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised while running a subprocess.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProcessError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command outlives its timeout and is killed.
    #[error("{program} did not finish within {seconds}s and was terminated")]
    Timeout {
        /// Command that timed out.
        program: String,
        /// Timeout that elapsed, in whole seconds.
        seconds: u64,
    },
    /// Raised when waiting on a running child fails.
    #[error("failed waiting for {program}: {message}")]
    Wait {
        /// Command being waited on.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the command cannot be started or does not
    /// finish in time.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ProcessError>;

    /// Runs `program` with the caller's standard streams attached.
    ///
    /// Runners that cannot attach streams fall back to [`CommandRunner::run`].
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Spawn`] if the command cannot be started.
    fn run_attached(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, ProcessError> {
        self.run(program, args)
    }
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug)]
pub struct ProcessCommandRunner {
    timeout: Duration,
}

impl ProcessCommandRunner {
    /// Creates a runner that kills captured commands after `timeout`.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Returns the configured timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ProcessCommandRunner {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ProcessError> {
        debug!(program, ?args, "running command");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(program, &err))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let code = wait_with_deadline(&mut child, program, self.timeout)?;

        Ok(CommandOutput {
            code,
            stdout: join_drain(stdout),
            stderr: join_drain(stderr),
        })
    }

    fn run_attached(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, ProcessError> {
        debug!(program, ?args, "running attached command");
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|err| spawn_error(program, &err))?;

        Ok(CommandOutput {
            code: status.code(),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

fn spawn_error(program: &str, err: &std::io::Error) -> ProcessError {
    ProcessError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}

fn wait_with_deadline(
    child: &mut Child,
    program: &str,
    timeout: Duration,
) -> Result<Option<i32>, ProcessError> {
    let deadline = Instant::now() + timeout;
    loop {
        let polled = child.try_wait().map_err(|err| ProcessError::Wait {
            program: program.to_owned(),
            message: err.to_string(),
        })?;
        if let Some(status) = polled {
            return Ok(status.code());
        }
        if Instant::now() >= deadline {
            child.kill().ok();
            child.wait().ok();
            return Err(ProcessError::Timeout {
                program: program.to_owned(),
                seconds: timeout.as_secs(),
            });
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

type DrainHandle = Option<thread::JoinHandle<String>>;

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> DrainHandle {
    stream.map(|mut reader| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            reader.read_to_end(&mut buffer).ok();
            String::from_utf8_lossy(&buffer).into_owned()
        })
    })
}

fn join_drain(handle: DrainHandle) -> String {
    handle
        .and_then(|join| join.join().ok())
        .unwrap_or_default()
}
