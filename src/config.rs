//! Global configuration loading via `ortho-config`.
//!
//! These settings belong to the operator rather than to a project: the API
//! credential, which endpoints to call, the machine image and where local
//! state is kept. Values merge defaults, `config.yml`/`.vessel.yml` files
//! and `VESSEL_*` environment variables.

use std::env;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Machines API endpoint exposed by `fly machines api-proxy`.
pub const DEFAULT_API_HOST: &str = "http://127.0.0.1:4280";

/// Fly GraphQL endpoint.
pub const DEFAULT_GRAPHQL_URL: &str = "https://api.fly.io/graphql";

/// Image booted for new environments.
pub const DEFAULT_IMAGE: &str = "vesselapp/php:8.1";

/// Operator-level settings shared by every project.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VESSEL",
    discovery(
        app_name = "vessel",
        env_var = "VESSEL_CONFIG_PATH",
        config_file_name = "config.yml",
        dotfile_name = ".vessel.yml",
        project_file_name = ".vessel.yml"
    )
)]
pub struct VesselConfig {
    /// Fly.io API token used as the bearer credential. Required.
    #[ortho_config(default = String::new())]
    pub access_token: String,
    /// Organisation slug that owns created applications.
    #[ortho_config(default = "personal".to_owned())]
    pub org: String,
    /// Base URL of the Machines REST API.
    #[ortho_config(default = DEFAULT_API_HOST.to_owned())]
    pub api_host: String,
    /// URL of the GraphQL API used for address allocation and region lookup.
    #[ortho_config(default = DEFAULT_GRAPHQL_URL.to_owned())]
    pub graphql_url: String,
    /// Container image booted on new machines.
    #[ortho_config(default = DEFAULT_IMAGE.to_owned())]
    pub image: String,
    /// Region for new machines; the nearest region is used when unset.
    pub region: Option<String>,
    /// Directory holding per-environment keys. Defaults to `~/.vessel`.
    pub storage_dir: Option<String>,
    /// SSH client configuration that receives host aliases. Defaults to
    /// `~/.ssh/config`.
    pub ssh_config_path: Option<String>,
    /// Explicit path to the `mutagen` executable.
    pub mutagen_bin: Option<String>,
    /// Release archive installed when no `mutagen` can be found. Defaults to
    /// the pinned upstream release for this platform.
    pub mutagen_download_url: Option<String>,
    /// Explicit path to `flyctl`, used to start the local Machines API proxy.
    pub flyctl_bin: Option<String>,
    /// Timeout applied to each provisioning API request.
    #[ortho_config(default = 30)]
    pub http_timeout_secs: u64,
    /// Timeout applied to each sync engine invocation.
    #[ortho_config(default = 60)]
    pub engine_timeout_secs: u64,
    /// Timeout for establishing SSH connections.
    #[ortho_config(default = 5)]
    pub ssh_connect_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    yaml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, yaml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            yaml_key,
        }
    }

    fn message(&self) -> String {
        format!(
            "missing {}: set {} or add {} to ~/.config/vessel/config.yml",
            self.description, self.env_var, self.yaml_key
        )
    }
}

impl VesselConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("vessel")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. A missing token is reported as a
    /// credential problem rather than a malformed file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredential`] when no token is set and
    /// [`ConfigError::MissingField`] when another required value is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token.trim().is_empty() {
            return Err(ConfigError::MissingCredential(
                FieldMetadata::new("Fly.io access token", "VESSEL_ACCESS_TOKEN", "access_token")
                    .message(),
            ));
        }
        let required = [
            (
                &self.org,
                FieldMetadata::new("organisation slug", "VESSEL_ORG", "org"),
            ),
            (
                &self.api_host,
                FieldMetadata::new("Machines API host", "VESSEL_API_HOST", "api_host"),
            ),
            (
                &self.graphql_url,
                FieldMetadata::new("GraphQL endpoint", "VESSEL_GRAPHQL_URL", "graphql_url"),
            ),
            (
                &self.image,
                FieldMetadata::new("machine image", "VESSEL_IMAGE", "image"),
            ),
        ];
        for (value, metadata) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(metadata.message()));
            }
        }
        Ok(())
    }

    /// Resolves the directory holding per-environment state.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHomeDirectory`] when no override is set and
    /// `HOME` is unavailable.
    pub fn storage_root(&self) -> Result<Utf8PathBuf, ConfigError> {
        resolve_under_home(self.storage_dir.as_deref(), ".vessel")
    }

    /// Resolves the SSH client configuration path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHomeDirectory`] when no override is set and
    /// `HOME` is unavailable.
    pub fn ssh_config_file(&self) -> Result<Utf8PathBuf, ConfigError> {
        resolve_under_home(self.ssh_config_path.as_deref(), ".ssh/config")
    }

    /// Directory `vessel` installs its own tools into.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHomeDirectory`] when the storage root cannot
    /// be resolved.
    pub fn tools_dir(&self) -> Result<Utf8PathBuf, ConfigError> {
        Ok(self.storage_root()?.join("bin"))
    }

    /// Returns the per-request provisioning API timeout.
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Returns the per-invocation sync engine timeout.
    #[must_use]
    pub const fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    /// Returns the SSH connect timeout.
    #[must_use]
    pub const fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }
}

fn resolve_under_home(
    explicit: Option<&str>,
    relative: &str,
) -> Result<Utf8PathBuf, ConfigError> {
    if let Some(path) = explicit.filter(|value| !value.trim().is_empty()) {
        return expand_tilde(path);
    }
    Ok(home_dir()?.join(relative))
}

/// Expands a leading `~/` using the `HOME` environment variable.
///
/// # Errors
///
/// Returns [`ConfigError::NoHomeDirectory`] when expansion is needed but
/// `HOME` is unset.
pub fn expand_tilde(path: &str) -> Result<Utf8PathBuf, ConfigError> {
    if path == "~" {
        return home_dir();
    }
    path.strip_prefix("~/").map_or_else(
        || Ok(Utf8PathBuf::from(path)),
        |rest| Ok(home_dir()?.join(rest)),
    )
}

/// Location `vessel auth` writes credentials to: `VESSEL_CONFIG_PATH`,
/// else `$XDG_CONFIG_HOME/vessel/config.yml`, else
/// `~/.config/vessel/config.yml`.
///
/// # Errors
///
/// Returns [`ConfigError::NoHomeDirectory`] when only the home-relative
/// default applies and `HOME` is unset.
pub fn user_config_file() -> Result<Utf8PathBuf, ConfigError> {
    if let Some(explicit) = non_empty_var("VESSEL_CONFIG_PATH") {
        return expand_tilde(&explicit);
    }
    if let Some(xdg) = non_empty_var("XDG_CONFIG_HOME") {
        return Ok(Utf8PathBuf::from(xdg).join("vessel").join("config.yml"));
    }
    Ok(home_dir()?.join(".config/vessel/config.yml"))
}

/// Configuration file written by `flyctl auth login`.
///
/// # Errors
///
/// Returns [`ConfigError::NoHomeDirectory`] when `HOME` is unset.
pub fn flyctl_config_file() -> Result<Utf8PathBuf, ConfigError> {
    Ok(home_dir()?.join(".fly/config.yml"))
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn home_dir() -> Result<Utf8PathBuf, ConfigError> {
    env::var("HOME")
        .ok()
        .filter(|home| !home.trim().is_empty())
        .map(Utf8PathBuf::from)
        .ok_or(ConfigError::NoHomeDirectory)
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates the API credential is absent.
    #[error("{0}")]
    MissingCredential(String),
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Raised when a home-relative default is needed but `HOME` is unset.
    #[error("HOME is not set; configure storage_dir and ssh_config_path explicitly")]
    NoHomeDirectory,
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
