//! `vessel auth`: validates a Fly.io token and stores it with an
//! organisation.
//!
//! The token comes from the command line or from the `flyctl` login in
//! `~/.fly/config.yml`. It is checked against the GraphQL API, an
//! organisation is chosen, and both are merged into the user configuration
//! file read by [`crate::config::VesselConfig`].

use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs::OpenOptionsExt;
use cap_std::fs_utf8::{Dir, OpenOptions};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::ProviderError;
use crate::config::VesselConfig;
use crate::fly::{FlyBackend, FlyBackendError, FlyEndpoints, Organization};

const CREDENTIALS_MODE: u32 = 0o600;

/// Errors raised by `vessel auth`.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Raised when no token was given and `flyctl` has none stored.
    #[error("no access token: pass --token or log in with `flyctl auth login` ({path} has none)")]
    NoToken {
        /// `flyctl` configuration that was consulted.
        path: Utf8PathBuf,
    },
    /// Raised when the token is rejected or the API cannot be reached.
    #[error("could not validate the access token: {0}")]
    Validate(#[source] FlyBackendError),
    /// Raised when the requested organisation is not available.
    #[error("organisation {requested:?} is not available to this token; choose one of: {available}")]
    UnknownOrg {
        /// Slug passed on the command line.
        requested: String,
        /// Comma separated slugs the token can use.
        available: String,
    },
    /// Raised when the token belongs to no organisation.
    #[error("the access token has no organisations")]
    NoOrganisations,
    /// Raised when a configuration file cannot be read, parsed or written.
    #[error("failed to access {path}: {message}")]
    File {
        /// File that failed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

impl AuthError {
    /// Returns `true` when the API rejected the token itself.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Validate(err) if err.is_unauthorized())
    }
}

/// Inputs to [`authenticate`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthRequest {
    /// Token given on the command line.
    pub token: Option<String>,
    /// Organisation slug given on the command line.
    pub org: Option<String>,
    /// `flyctl` configuration consulted when no token is given.
    pub flyctl_config: Utf8PathBuf,
    /// File the credentials are written to.
    pub target: Utf8PathBuf,
}

/// Stored result of [`authenticate`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
    /// Account the token belongs to.
    pub email: String,
    /// Organisation new applications are created in.
    pub org: Organization,
    /// File the credentials were written to.
    pub path: Utf8PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct FlyctlConfig {
    #[serde(default)]
    access_token: Option<String>,
}

/// Validates a token against the configured GraphQL endpoint and stores it.
///
/// # Errors
///
/// Returns [`AuthError`] when no token is available, the token is rejected,
/// the organisation cannot be chosen or the file cannot be written.
pub async fn authenticate(
    config: &VesselConfig,
    request: &AuthRequest,
) -> Result<Credentials, AuthError> {
    let token = match request
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
    {
        Some(token) => token.to_owned(),
        None => read_flyctl_token(&request.flyctl_config)?.ok_or_else(|| AuthError::NoToken {
            path: request.flyctl_config.clone(),
        })?,
    };

    let backend = FlyBackend::with_endpoints(
        FlyEndpoints::new(&config.api_host, &config.graphql_url),
        &token,
        config.http_timeout(),
    )
    .map_err(AuthError::Validate)?;
    let viewer = backend.viewer().await.map_err(AuthError::Validate)?;
    let org = choose_org(&viewer.organizations, request.org.as_deref())?;

    store_credentials(&request.target, &token, &org.slug)?;
    info!(email = %viewer.email, org = %org.slug, path = %request.target, "stored credentials");
    Ok(Credentials {
        email: viewer.email,
        org,
        path: request.target.clone(),
    })
}

/// Reads the token `flyctl auth login` stored. Returns `None` when the file
/// or the key is absent.
///
/// # Errors
///
/// Returns [`AuthError::File`] when the file exists but cannot be read or
/// parsed.
pub fn read_flyctl_token(path: &Utf8Path) -> Result<Option<String>, AuthError> {
    let Some(contents) = read_optional(path)? else {
        debug!(path = %path, "no flyctl configuration");
        return Ok(None);
    };
    let parsed: FlyctlConfig = serde_yaml::from_str(&contents)
        .map_err(|err| file_error(path, &err.to_string()))?;
    Ok(parsed
        .access_token
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty()))
}

/// Picks the organisation new applications are created in.
///
/// A requested slug must be available. Without one, a single organisation
/// is used as is; otherwise the personal organisation wins, then the first
/// listed.
///
/// # Errors
///
/// Returns [`AuthError::UnknownOrg`] for an unavailable slug and
/// [`AuthError::NoOrganisations`] when the list is empty.
pub fn choose_org(
    organizations: &[Organization],
    requested: Option<&str>,
) -> Result<Organization, AuthError> {
    if let Some(slug) = requested.map(str::trim).filter(|slug| !slug.is_empty()) {
        return organizations
            .iter()
            .find(|org| org.slug == slug)
            .cloned()
            .ok_or_else(|| AuthError::UnknownOrg {
                requested: slug.to_owned(),
                available: organizations
                    .iter()
                    .map(|org| org.slug.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
    }
    organizations
        .iter()
        .find(|org| org.kind.eq_ignore_ascii_case("personal"))
        .or_else(|| organizations.first())
        .cloned()
        .ok_or(AuthError::NoOrganisations)
}

/// Merges `access_token` and `org` into the YAML file at `path`, keeping
/// every other key. The file is created with mode `0600`.
///
/// # Errors
///
/// Returns [`AuthError::File`] when the file cannot be read, parsed or
/// written.
pub fn store_credentials(path: &Utf8Path, token: &str, org: &str) -> Result<(), AuthError> {
    let mut document = match read_optional(path)? {
        Some(contents) if !contents.trim().is_empty() => {
            serde_yaml::from_str::<Mapping>(&contents)
                .map_err(|err| file_error(path, &err.to_string()))?
        }
        _ => Mapping::new(),
    };
    document.insert(Value::from("access_token"), Value::from(token));
    document.insert(Value::from("org"), Value::from(org));
    let rendered =
        serde_yaml::to_string(&document).map_err(|err| file_error(path, &err.to_string()))?;

    let parent = parent_of(path);
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| file_error(path, "path is missing a file name"))?;
    let mut options = OpenOptions::new();
    options
        .write(true)
        .create(true)
        .truncate(true)
        .mode(CREDENTIALS_MODE);
    let mut file = dir
        .open_with(file_name, &options)
        .map_err(|err| io_error(path, &err))?;
    file.write_all(rendered.as_bytes())
        .map_err(|err| io_error(path, &err))?;
    Ok(())
}

fn read_optional(path: &Utf8Path) -> Result<Option<String>, AuthError> {
    let parent = parent_of(path);
    let Some(file_name) = path.file_name() else {
        return Ok(None);
    };
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(parent, &err)),
    };
    match dir.read_to_string(file_name) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(path, &err)),
    }
}

fn parent_of(path: &Utf8Path) -> &Utf8Path {
    path.parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."))
}

fn io_error(path: &Utf8Path, err: &io::Error) -> AuthError {
    file_error(path, &err.to_string())
}

fn file_error(path: &Utf8Path, message: &str) -> AuthError {
    AuthError::File {
        path: path.to_path_buf(),
        message: message.to_owned(),
    }
}
