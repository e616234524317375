//! Error taxonomy surfaced by the lifecycle coordinator.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::backend::ProviderError;
use crate::config::ConfigError;
use crate::config_store::ConfigStoreError;
use crate::fly::ProxyError;
use crate::keys::KeyError;
use crate::project::ProjectConfigError;
use crate::sync::{InstallError, SyncError};
use crate::transport::{ConnectionError, TransportError};

/// Boxed lower-level failure kept as an error source.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Local configuration is malformed or missing.
    #[error("configuration error: {0}")]
    Config(#[source] BoxedError),
    /// The API credential is missing or was rejected.
    #[error("credential error: {0}")]
    Credential(#[source] BoxedError),
    /// The provisioning API rejected or failed a request.
    #[error("failed to {step}: {source}")]
    Provisioning {
        /// Step that failed, phrased as a verb.
        step: &'static str,
        /// Provider failure.
        #[source]
        source: BoxedError,
    },
    /// A bounded poll exhausted its budget.
    #[error("{what} was not ready after {attempts} attempts")]
    Timeout {
        /// Resource being waited on.
        what: &'static str,
        /// Queries issued.
        attempts: u32,
    },
    /// The environment could not be reached over SSH.
    #[error(transparent)]
    Connection(ConnectionError),
    /// A remote command or shell failed.
    #[error("remote session failed: {0}")]
    Remote(#[source] TransportError),
    /// The sync engine failed.
    #[error("sync engine error: {0}")]
    Sync(#[source] SyncError),
    /// A required tool is missing or could not be installed or started.
    #[error("{0}")]
    Setup(#[source] BoxedError),
    /// The access keypair could not be generated.
    #[error("failed to generate access key: {0}")]
    Crypto(#[from] KeyError),
    /// Local state could not be read or written.
    #[error("local state error: {0}")]
    Store(#[source] ConfigStoreError),
    /// Local state for this environment already exists.
    #[error("environment already initialised: {path} exists")]
    AlreadyInitialised {
        /// Conflicting path.
        path: Utf8PathBuf,
    },
}

impl LifecycleError {
    /// Maps a provider failure for `step`, separating credential rejections.
    #[must_use]
    pub fn provisioning<E: ProviderError>(step: &'static str, err: E) -> Self {
        if err.is_unauthorized() {
            Self::Credential(Box::new(err))
        } else {
            Self::Provisioning {
                step,
                source: Box::new(err),
            }
        }
    }

    /// Short, actionable message printed when not in verbose mode.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Config(source) => format!("configuration problem: {source}"),
            Self::Credential(_) => String::from(
                "the Fly.io access token is missing or was rejected; set VESSEL_ACCESS_TOKEN \
                 or access_token in config.yml",
            ),
            Self::Provisioning { step, .. } => {
                format!("could not {step}; rerun with --verbose for details")
            }
            Self::Timeout { what, .. } => format!(
                "{what} did not become ready in time; it may still exist, run `vessel destroy` to remove it"
            ),
            Self::Connection(err) => format!(
                "could not reach the environment over SSH ({} failed)",
                err.stage
            ),
            Self::Remote(err) => err.to_string(),
            Self::Sync(_) => {
                String::from("the sync engine reported an error; rerun with --verbose for details")
            }
            Self::Setup(err) => err.to_string(),
            Self::Crypto(_) => String::from("could not generate an SSH key for the environment"),
            Self::Store(err) => err.to_string(),
            Self::AlreadyInitialised { path } => format!(
                "an environment already exists ({path}); run `vessel destroy` before `vessel init`"
            ),
        }
    }
}

impl From<ConfigError> for LifecycleError {
    fn from(value: ConfigError) -> Self {
        match value {
            ConfigError::MissingCredential(_) => Self::Credential(Box::new(value)),
            other => Self::Config(Box::new(other)),
        }
    }
}

impl From<ProjectConfigError> for LifecycleError {
    fn from(value: ProjectConfigError) -> Self {
        Self::Config(Box::new(value))
    }
}

impl From<ConfigStoreError> for LifecycleError {
    fn from(value: ConfigStoreError) -> Self {
        match value {
            ConfigStoreError::AlreadyExists { path } => Self::AlreadyInitialised { path },
            ConfigStoreError::MissingProject { .. }
            | ConfigStoreError::Project { .. }
            | ConfigStoreError::UnreadableIdentity { .. } => {
                Self::Config(Box::new(value))
            }
            ConfigStoreError::Io { .. } => Self::Store(value),
        }
    }
}

impl From<SyncError> for LifecycleError {
    fn from(value: SyncError) -> Self {
        if value.is_setup() {
            Self::Setup(Box::new(value))
        } else {
            Self::Sync(value)
        }
    }
}

impl From<ConnectionError> for LifecycleError {
    fn from(value: ConnectionError) -> Self {
        Self::Connection(value)
    }
}

impl From<TransportError> for LifecycleError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Connection(err) => Self::Connection(err),
            other => Self::Remote(other),
        }
    }
}

impl From<InstallError> for LifecycleError {
    fn from(value: InstallError) -> Self {
        Self::Setup(Box::new(value))
    }
}

impl From<ProxyError> for LifecycleError {
    fn from(value: ProxyError) -> Self {
        match value {
            ProxyError::InvalidHost { .. } => Self::Config(Box::new(value)),
            other => Self::Setup(Box::new(other)),
        }
    }
}
