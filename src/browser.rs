//! `vessel open`: shows the first forwarded port in the local browser.

use std::ffi::OsString;

use thiserror::Error;
use tracing::debug;

use crate::process::{CommandRunner, ProcessError};
use crate::project::{ProjectConfig, ProjectConfigError};

/// Program that hands a URL to the desktop's default browser.
#[cfg(target_os = "macos")]
pub const DEFAULT_OPENER: &str = "open";

/// Program that hands a URL to the desktop's default browser.
#[cfg(not(target_os = "macos"))]
pub const DEFAULT_OPENER: &str = "xdg-open";

/// Errors raised while opening the browser.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BrowserError {
    /// Raised when the project has no usable forwarding rule.
    #[error(transparent)]
    Project(#[from] ProjectConfigError),
    /// Raised when the opener cannot be run.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Raised when the opener exits unsuccessfully.
    #[error("{program} could not open {url} (status {status}): {stderr}")]
    Failed {
        /// Opener program.
        program: String,
        /// URL that was passed.
        url: String,
        /// Exit status text.
        status: String,
        /// Captured stderr.
        stderr: String,
    },
}

/// URL of the first forwarded port on the workstation.
///
/// # Errors
///
/// Returns [`ProjectConfigError::NoForwarding`] when no rule is configured
/// and [`ProjectConfigError::InvalidForward`] when the first rule is
/// malformed.
pub fn forwarded_url(project: &ProjectConfig) -> Result<String, ProjectConfigError> {
    let rules = project.forward_rules()?;
    rules
        .first()
        .map(|rule| format!("http://localhost:{}", rule.local))
        .ok_or(ProjectConfigError::NoForwarding)
}

/// Opens `url` with `opener`.
///
/// # Errors
///
/// Returns [`BrowserError::Process`] when the opener cannot be run and
/// [`BrowserError::Failed`] when it reports failure.
pub fn open_url<R: CommandRunner>(runner: &R, opener: &str, url: &str) -> Result<(), BrowserError> {
    debug!(opener, url, "opening browser");
    let output = runner.run(opener, &[OsString::from(url)])?;
    if output.is_success() {
        return Ok(());
    }
    Err(BrowserError::Failed {
        program: opener.to_owned(),
        url: url.to_owned(),
        status: output.status_text(),
        stderr: output.stderr.trim().to_owned(),
    })
}

#[cfg(test)]
mod tests;
