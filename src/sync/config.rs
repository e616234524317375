//! Sync engine discovery and error types.
//!
//! The engine is `mutagen`, driven as an external executable. Locating it is
//! a setup concern: a missing binary is reported separately from failures of
//! the sessions it manages.

use camino::Utf8Path;
use thiserror::Error;

use crate::process::ProcessError;

/// Executable name looked up on `PATH`.
pub const ENGINE_PROGRAM: &str = "mutagen";

/// Patterns every sync session ignores in addition to VCS metadata.
pub const DEFAULT_IGNORES: [&str; 2] = ["node_modules", "vendor"];

/// Resolved engine invocation settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EngineConfig {
    /// Program passed to the command runner.
    pub program: String,
    /// Extra ignore patterns appended after [`DEFAULT_IGNORES`].
    pub extra_ignores: Vec<String>,
}

impl EngineConfig {
    /// Uses `program` verbatim without searching for it.
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_ignores: Vec::new(),
        }
    }

    /// Adds ignore patterns applied to new sync sessions.
    #[must_use]
    pub fn with_ignores(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.extra_ignores.extend(patterns);
        self
    }

    /// Locates the engine executable.
    ///
    /// An explicit path must exist. Otherwise `mutagen` is searched for on
    /// `PATH` and then inside `fallback_dir` (where `vessel` installs its own
    /// copy).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Setup`] when no executable can be found.
    pub fn discover(explicit: Option<&str>, fallback_dir: Option<&Utf8Path>) -> Result<Self, SyncError> {
        if let Some(program) = explicit.map(str::trim).filter(|value| !value.is_empty()) {
            return which::which(program)
                .map(|path| Self::with_program(path.to_string_lossy().into_owned()))
                .map_err(|err| SyncError::Setup {
                    program: program.to_owned(),
                    message: err.to_string(),
                });
        }

        if let Ok(path) = which::which(ENGINE_PROGRAM) {
            return Ok(Self::with_program(path.to_string_lossy().into_owned()));
        }

        fallback_dir
            .map(|dir| dir.join(ENGINE_PROGRAM))
            .filter(|candidate| candidate.is_file())
            .map(|candidate| Self::with_program(candidate.into_string()))
            .ok_or_else(|| SyncError::Setup {
                program: ENGINE_PROGRAM.to_owned(),
                message: String::from("not found on PATH"),
            })
    }
}

/// Errors surfaced while driving sync and forward sessions.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SyncError {
    /// Raised when the engine executable is unavailable.
    #[error(
        "{program} is required but could not be located ({message}); install it from \
         https://mutagen.io or set VESSEL_MUTAGEN_BIN"
    )]
    Setup {
        /// Executable that was searched for.
        program: String,
        /// Lookup failure detail.
        message: String,
    },
    /// Raised when the engine process cannot be run to completion.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Raised when the engine exits with a non-zero status.
    #[error("{program} {action} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Engine program.
        program: String,
        /// Engine subcommand, for example `sync create`.
        action: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when engine output cannot be interpreted.
    #[error("could not parse {action} output: {message}")]
    Parse {
        /// Engine subcommand whose output was malformed.
        action: String,
        /// Parser message.
        message: String,
    },
    /// Raised when stopping sessions fails for one or both session kinds.
    #[error("{}", render_stop_failure(.sync.as_deref(), .forward.as_deref()))]
    Stop {
        /// Failure while stopping sync sessions.
        sync: Option<Box<SyncError>>,
        /// Failure while stopping forward sessions.
        forward: Option<Box<SyncError>>,
    },
}

fn render_stop_failure(sync: Option<&SyncError>, forward: Option<&SyncError>) -> String {
    match (sync, forward) {
        (Some(sync_err), Some(forward_err)) => format!(
            "failed to stop sync sessions: {sync_err}; failed to stop forward sessions: {forward_err}"
        ),
        (Some(sync_err), None) => format!("failed to stop sync sessions: {sync_err}"),
        (None, Some(forward_err)) => format!("failed to stop forward sessions: {forward_err}"),
        (None, None) => String::from("failed to stop sessions"),
    }
}

impl SyncError {
    /// Returns `true` when the error means the engine is not installed.
    #[must_use]
    pub const fn is_setup(&self) -> bool {
        matches!(self, Self::Setup { .. })
    }
}
