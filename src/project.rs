//! The per-project environment descriptor persisted as `vessel.yml`.
//!
//! The document records where the remote environment lives, which key
//! reaches it, and which ports are forwarded. It is produced by `init` and
//! consumed by every other command.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default login user baked into the remote image.
pub const DEFAULT_REMOTE_USER: &str = "vessel";

/// Default SSH port on the remote machine.
pub const DEFAULT_REMOTE_PORT: u16 = 22;

/// Default working directory on the remote machine.
pub const DEFAULT_REMOTE_PATH: &str = "/home/vessel/app";

/// Default forwarding rule written by `init`.
pub const DEFAULT_FORWARDING: &str = "8000:80";

/// Persisted project configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProjectConfig {
    /// Project (and remote application) name.
    #[serde(default)]
    pub name: String,
    /// Connection parameters for the remote machine.
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Port forwarding rules in `local:remote` form.
    #[serde(default)]
    pub forwarding: Vec<String>,
}

/// Connection parameters for the remote machine.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RemoteConfig {
    /// Address the SSH client dials.
    #[serde(default)]
    pub hostname: String,
    /// Login user.
    #[serde(default)]
    pub user: String,
    /// Path to the private key owned by this environment.
    #[serde(default)]
    pub identityfile: String,
    /// SSH port.
    #[serde(default)]
    pub port: u16,
    /// Working directory synchronised with the local project.
    #[serde(default)]
    pub path: String,
    /// Host alias registered in the SSH client configuration.
    #[serde(default)]
    pub alias: String,
}

/// One `local:remote` port forwarding rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ForwardRule {
    /// Port bound on the workstation loopback interface.
    pub local: u16,
    /// Port on the remote machine's loopback interface.
    pub remote: u16,
}

impl FromStr for ForwardRule {
    type Err = ProjectConfigError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| ProjectConfigError::InvalidForward {
            entry: entry.to_owned(),
            message: message.to_owned(),
        };
        let (local_text, remote_text) = entry
            .trim()
            .split_once(':')
            .ok_or_else(|| invalid("expected local:remote"))?;
        Ok(Self {
            local: parse_port(local_text).ok_or_else(|| invalid("local port must be 1-65535"))?,
            remote: parse_port(remote_text)
                .ok_or_else(|| invalid("remote port must be 1-65535"))?,
        })
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

fn parse_port(value: &str) -> Option<u16> {
    value.trim().parse::<u16>().ok().filter(|port| *port != 0)
}

/// Errors raised while parsing or validating the project document.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProjectConfigError {
    /// Raised when a required field is missing or empty.
    #[error("missing {field} in project configuration: {hint}")]
    MissingField {
        /// Dotted path of the field, for example `remote.user`.
        field: &'static str,
        /// What the field is for.
        hint: &'static str,
    },
    /// Raised when no forwarding rules are configured.
    #[error("no forwarding ports are defined: add at least one \"local:remote\" entry to forwarding")]
    NoForwarding,
    /// Raised when a forwarding entry cannot be parsed.
    #[error("invalid forwarding entry {entry:?}: {message}")]
    InvalidForward {
        /// Entry as written in the document.
        entry: String,
        /// Parser message.
        message: String,
    },
    /// Raised when the document is not valid YAML for this schema.
    #[error("failed to parse project configuration: {0}")]
    Parse(String),
    /// Raised when the document cannot be serialised.
    #[error("failed to render project configuration: {0}")]
    Render(String),
}

impl ProjectConfig {
    /// Builds the descriptor `init` writes for a freshly provisioned machine.
    #[must_use]
    pub fn for_new_environment(name: &str, hostname: &str, identity_file: &str) -> Self {
        Self {
            name: name.to_owned(),
            remote: RemoteConfig {
                hostname: hostname.to_owned(),
                user: DEFAULT_REMOTE_USER.to_owned(),
                identityfile: identity_file.to_owned(),
                port: DEFAULT_REMOTE_PORT,
                path: DEFAULT_REMOTE_PATH.to_owned(),
                alias: host_alias(name),
            },
            forwarding: vec![DEFAULT_FORWARDING.to_owned()],
        }
    }

    /// Parses a YAML document without validating it.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectConfigError::Parse`] for malformed YAML.
    pub fn from_yaml(contents: &str) -> Result<Self, ProjectConfigError> {
        serde_yaml::from_str(contents).map_err(|err| ProjectConfigError::Parse(err.to_string()))
    }

    /// Renders the descriptor as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectConfigError::Render`] when serialisation fails.
    pub fn to_yaml(&self) -> Result<String, ProjectConfigError> {
        serde_yaml::to_string(self).map_err(|err| ProjectConfigError::Render(err.to_string()))
    }

    /// Checks that every field needed to reach the environment is present.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProjectConfigError`] found, naming the field.
    pub fn validate(&self) -> Result<(), ProjectConfigError> {
        require(&self.name, "name", "the application name")?;
        if self.forwarding.is_empty() {
            return Err(ProjectConfigError::NoForwarding);
        }
        require(
            &self.remote.hostname,
            "remote.hostname",
            "the host to SSH into",
        )?;
        require(&self.remote.user, "remote.user", "the user to SSH in as")?;
        require(
            &self.remote.identityfile,
            "remote.identityfile",
            "the SSH private key path",
        )?;
        require(&self.remote.path, "remote.path", "the remote directory to sync with")?;
        if self.remote.port == 0 {
            return Err(ProjectConfigError::MissingField {
                field: "remote.port",
                hint: "the SSH port (must be nonzero)",
            });
        }
        self.forward_rules().map(|_| ())
    }

    /// Parses every forwarding entry in list order.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectConfigError::InvalidForward`] for the first entry
    /// that cannot be parsed.
    pub fn forward_rules(&self) -> Result<Vec<ForwardRule>, ProjectConfigError> {
        self.forwarding
            .iter()
            .map(|entry| entry.parse::<ForwardRule>())
            .collect()
    }

    /// Returns the SSH target the sync engine uses for remote endpoints.
    ///
    /// The registered host alias is preferred. Without one the target is
    /// `user@host[:port]`, with IPv6 literals bracketed so the engine can
    /// tell the address from the port and path separators.
    #[must_use]
    pub fn ssh_target(&self) -> String {
        let remote = &self.remote;
        if !remote.alias.trim().is_empty() {
            return remote.alias.clone();
        }
        let host = if remote.hostname.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]", remote.hostname)
        } else {
            remote.hostname.clone()
        };
        if remote.port == DEFAULT_REMOTE_PORT {
            format!("{}@{host}", remote.user)
        } else {
            format!("{}@{host}:{}", remote.user, remote.port)
        }
    }
}

/// Returns the SSH config host alias used for an application.
#[must_use]
pub fn host_alias(app_name: &str) -> String {
    format!("vessel-{app_name}")
}

fn require(value: &str, field: &'static str, hint: &'static str) -> Result<(), ProjectConfigError> {
    if value.trim().is_empty() {
        return Err(ProjectConfigError::MissingField { field, hint });
    }
    Ok(())
}
