//! Session records reported by the engine and the plan used to create them.

use std::fmt;

use serde::Deserialize;

use crate::project::{ForwardRule, ProjectConfig, ProjectConfigError};

use super::SyncError;

/// The two session families the engine manages.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SessionKind {
    /// Bidirectional file synchronisation.
    Sync,
    /// TCP port forwarding.
    Forward,
}

impl SessionKind {
    /// Engine subcommand addressing this family.
    #[must_use]
    pub const fn command(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Forward => "forward",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

/// One session as reported by the engine's `list` command.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SessionRecord {
    /// Opaque engine identifier.
    pub identifier: String,
    /// Name assigned at creation.
    #[serde(default)]
    pub name: String,
    /// Whether the session is paused.
    #[serde(default)]
    pub paused: bool,
}

/// Parses the JSON emitted by `<kind> list --template '{{ json . }}'`.
///
/// An empty document and `null` both mean no sessions.
///
/// # Errors
///
/// Returns [`SyncError::Parse`] when the output is not a JSON array of
/// session objects.
pub fn parse_session_list(kind: SessionKind, stdout: &str) -> Result<Vec<SessionRecord>, SyncError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let records: Option<Vec<SessionRecord>> =
        serde_json::from_str(trimmed).map_err(|err| SyncError::Parse {
            action: format!("{kind} list"),
            message: err.to_string(),
        })?;
    Ok(records.unwrap_or_default())
}

/// Extracts the identifier from `Created session <id>` output.
#[must_use]
pub fn parse_created_identifier(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Created session"))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(str::to_owned)
        .next()
}

/// Everything needed to start one project's sessions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionPlan {
    /// SSH target (host alias or `user@host`) for remote endpoints.
    pub target: String,
    /// Remote working directory.
    pub remote_path: String,
    /// Forwarding rules in list order.
    pub forwards: Vec<ForwardRule>,
}

impl SessionPlan {
    /// Builds a plan from a validated project descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectConfigError`] when a forwarding rule is malformed.
    pub fn from_project(project: &ProjectConfig) -> Result<Self, ProjectConfigError> {
        Ok(Self {
            target: project.ssh_target(),
            remote_path: project.remote.path.clone(),
            forwards: project.forward_rules()?,
        })
    }
}

/// Identifiers of the sessions backing one project.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StartedSessions {
    /// Sync session identifier.
    pub sync: String,
    /// Forward session identifiers in rule order.
    pub forwards: Vec<String>,
}
