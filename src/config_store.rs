//! Local persistence for environment state.
//!
//! One environment owns three pieces of local state: the project document
//! (`vessel.yml` in the working directory), a per-environment directory
//! holding the access keypair, and a host alias in the SSH client
//! configuration. Paths are opened through `cap-std` directory handles.

use std::io::{self, Write};
use std::str::SplitWhitespace;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptionsExt;
use cap_std::fs_utf8::{Dir, OpenOptions};
use cap_std::ambient_authority;
use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, VesselConfig, expand_tilde};
use crate::keys::AccessKeypair;
use crate::project::{ProjectConfig, ProjectConfigError};

/// Default project document name.
pub const PROJECT_FILE_NAME: &str = "vessel.yml";

/// File name of the private key inside an environment directory.
pub const PRIVATE_KEY_FILE: &str = "id_ed25519";

/// File name of the public key inside an environment directory.
pub const PUBLIC_KEY_FILE: &str = "id_ed25519.pub";

const PRIVATE_KEY_MODE: u32 = 0o600;
const PUBLIC_KEY_MODE: u32 = 0o644;

/// Errors raised while reading or writing local state.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigStoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when no project document exists yet.
    #[error("no project configuration at {path}; run `vessel init` first")]
    MissingProject {
        /// Expected document location.
        path: Utf8PathBuf,
    },
    /// Raised when state for an environment is already present.
    #[error("{path} already exists; destroy the existing environment first")]
    AlreadyExists {
        /// Conflicting path.
        path: Utf8PathBuf,
    },
    /// Raised when the private key named by `remote.identityfile` cannot
    /// be opened for reading.
    #[error(
        "remote.identityfile {path} cannot be read ({message}); restore the key or run \
         `vessel destroy` followed by `vessel init`"
    )]
    UnreadableIdentity {
        /// Key location after `~` expansion.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the project document is malformed or incomplete.
    #[error("invalid project configuration in {path}: {source}")]
    Project {
        /// Document location.
        path: Utf8PathBuf,
        /// Underlying parse or validation failure.
        #[source]
        source: ProjectConfigError,
    },
}

/// Paths written by [`EnvironmentStore::write_keypair`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPaths {
    /// Private key, readable only by the owner.
    pub private_key: Utf8PathBuf,
    /// Public key.
    pub public_key: Utf8PathBuf,
}

/// Reads and writes the local state belonging to environments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnvironmentStore {
    project_file: Utf8PathBuf,
    storage_root: Utf8PathBuf,
    ssh_config: Utf8PathBuf,
}

impl EnvironmentStore {
    /// Creates a store over explicit locations.
    #[must_use]
    pub const fn new(
        project_file: Utf8PathBuf,
        storage_root: Utf8PathBuf,
        ssh_config: Utf8PathBuf,
    ) -> Self {
        Self {
            project_file,
            storage_root,
            ssh_config,
        }
    }

    /// Creates a store using the configured storage and SSH config paths.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoHomeDirectory`] when a home-relative default
    /// cannot be resolved.
    pub fn from_config(
        config: &VesselConfig,
        project_file: Utf8PathBuf,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            project_file,
            config.storage_root()?,
            config.ssh_config_file()?,
        ))
    }

    /// Location of the project document.
    #[must_use]
    pub fn project_file(&self) -> &Utf8Path {
        &self.project_file
    }

    /// Location of the SSH client configuration.
    #[must_use]
    pub fn ssh_config(&self) -> &Utf8Path {
        &self.ssh_config
    }

    /// Directory holding the state of environment `app`.
    #[must_use]
    pub fn env_dir(&self, app: &str) -> Utf8PathBuf {
        self.storage_root.join(app)
    }

    /// Returns `true` when a project document exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError::Io`] when the parent directory cannot be
    /// inspected.
    pub fn project_exists(&self) -> Result<bool, ConfigStoreError> {
        path_exists(&self.project_file)
    }

    /// Reads and validates the project document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError::MissingProject`] when the document does
    /// not exist and [`ConfigStoreError::Project`] when it is malformed or
    /// incomplete.
    pub fn read_project(&self) -> Result<ProjectConfig, ConfigStoreError> {
        let path = &self.project_file;
        let (dir, file_name) = open_parent(path)?;
        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigStoreError::MissingProject {
                    path: path.clone(),
                });
            }
            Err(err) => return Err(io_error(path, &err)),
        };

        let project = ProjectConfig::from_yaml(&contents).map_err(|source| {
            ConfigStoreError::Project {
                path: path.clone(),
                source,
            }
        })?;
        project
            .validate()
            .map_err(|source| ConfigStoreError::Project {
                path: path.clone(),
                source,
            })?;
        Ok(project)
    }

    /// Reads the project document of an environment that is about to be
    /// used over SSH.
    ///
    /// On top of [`EnvironmentStore::read_project`] this checks that the
    /// private key named by `remote.identityfile` exists and can be opened.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`EnvironmentStore::read_project`] and
    /// [`ConfigStoreError::UnreadableIdentity`] when the key is missing or
    /// unreadable.
    pub fn read_ready_project(&self) -> Result<ProjectConfig, ConfigStoreError> {
        let project = self.read_project()?;
        check_identity(&project.remote.identityfile)?;
        Ok(project)
    }

    /// Writes the project document, replacing any previous content.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when rendering or writing fails.
    pub fn write_project(&self, project: &ProjectConfig) -> Result<(), ConfigStoreError> {
        let path = &self.project_file;
        let rendered = project
            .to_yaml()
            .map_err(|source| ConfigStoreError::Project {
                path: path.clone(),
                source,
            })?;
        let (dir, file_name) = open_parent(path)?;
        dir.write(file_name, rendered)
            .map_err(|err| io_error(path, &err))?;
        debug!(path = %path, "wrote project configuration");
        Ok(())
    }

    /// Removes the project document. Returns `false` when it was absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError::Io`] when removal fails.
    pub fn remove_project(&self) -> Result<bool, ConfigStoreError> {
        let path = &self.project_file;
        if !path_exists(path)? {
            return Ok(false);
        }
        let (dir, file_name) = open_parent(path)?;
        match dir.remove_file(file_name) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(path, &err)),
        }
    }

    /// Creates the directory for environment `app`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError::AlreadyExists`] when the directory is
    /// already present and [`ConfigStoreError::Io`] on other failures.
    pub fn create_env_dir(&self, app: &str) -> Result<Utf8PathBuf, ConfigStoreError> {
        let root = self.open_storage_root(true)?;
        let path = self.env_dir(app);
        match root.create_dir(app) {
            Ok(()) => Ok(path),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(ConfigStoreError::AlreadyExists { path })
            }
            Err(err) => Err(io_error(&path, &err)),
        }
    }

    /// Returns `true` when the directory for environment `app` exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError::Io`] when the storage root cannot be
    /// inspected.
    pub fn env_dir_exists(&self, app: &str) -> Result<bool, ConfigStoreError> {
        path_exists(&self.env_dir(app))
    }

    /// Persists `keypair` inside the directory for environment `app`.
    ///
    /// The private key is created with mode `0600`, the public key with `0644`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError::Io`] when either file cannot be written.
    pub fn write_keypair(
        &self,
        app: &str,
        keypair: &AccessKeypair,
    ) -> Result<KeyPaths, ConfigStoreError> {
        let env_dir = self.env_dir(app);
        let dir = Dir::open_ambient_dir(&env_dir, ambient_authority())
            .map_err(|err| io_error(&env_dir, &err))?;

        let private_key = env_dir.join(PRIVATE_KEY_FILE);
        let mut options = OpenOptions::new();
        options
            .write(true)
            .create_new(true)
            .mode(PRIVATE_KEY_MODE);
        let mut private_file = dir
            .open_with(PRIVATE_KEY_FILE, &options)
            .map_err(|err| io_error(&private_key, &err))?;
        private_file
            .write_all(keypair.private_key.expose().as_bytes())
            .map_err(|err| io_error(&private_key, &err))?;

        let public_key = env_dir.join(PUBLIC_KEY_FILE);
        options.mode(PUBLIC_KEY_MODE);
        let mut public_file = dir
            .open_with(PUBLIC_KEY_FILE, &options)
            .map_err(|err| io_error(&public_key, &err))?;
        writeln!(public_file, "{}", keypair.public_key)
            .map_err(|err| io_error(&public_key, &err))?;

        debug!(path = %private_key, "stored access keypair");
        Ok(KeyPaths {
            private_key,
            public_key,
        })
    }

    /// Removes the directory for environment `app` and everything in it.
    /// Returns `false` when it was absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError::Io`] when removal fails.
    pub fn remove_env_dir(&self, app: &str) -> Result<bool, ConfigStoreError> {
        let path = self.env_dir(app);
        if !path_exists(&path)? {
            return Ok(false);
        }
        let root = self.open_storage_root(false)?;
        match root.remove_dir_all(app) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(&path, &err)),
        }
    }

    /// Makes sure the SSH client configuration carries a `Host` block for
    /// the environment's alias that points at the current machine.
    ///
    /// A block whose `Host` line names only the alias belongs to vessel and
    /// is rewritten in place when it differs from the rendered one. A block
    /// shared with other patterns is never edited; its `HostName` is
    /// reported back instead.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError::Io`] when the file cannot be read or
    /// written.
    pub fn register_host(
        &self,
        project: &ProjectConfig,
        use_ipv6: bool,
    ) -> Result<HostRegistration, ConfigStoreError> {
        let path = &self.ssh_config;
        let alias = &project.remote.alias;
        let parent = parent_of(path);
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;
        let (dir, file_name) = open_parent(path)?;

        let existing = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(io_error(path, &err)),
        };
        let rendered = render_host_block(project, use_ipv6);
        let lines: Vec<&str> = existing.lines().collect();

        let (updated, registration) = match find_host_block(&lines, alias) {
            None => (append_block(&existing, &rendered), HostRegistration::Added),
            Some(block) if block.shared => {
                return Ok(match block.hostname {
                    Some(hostname) if hostname != project.remote.hostname => {
                        HostRegistration::Kept {
                            hostname: hostname.to_owned(),
                        }
                    }
                    _ => HostRegistration::Unchanged,
                });
            }
            Some(block) if block.text(&lines).trim_end() == rendered.trim_end() => {
                debug!(alias = %alias, "SSH host alias already registered");
                return Ok(HostRegistration::Unchanged);
            }
            Some(block) => (
                block.replace_with(&lines, &rendered),
                HostRegistration::Replaced {
                    previous: block.hostname.map(str::to_owned),
                },
            ),
        };

        dir.write(file_name, updated)
            .map_err(|err| io_error(path, &err))?;
        debug!(alias = %alias, path = %path, ?registration, "registered SSH host alias");
        Ok(registration)
    }

    fn open_storage_root(&self, create: bool) -> Result<Dir, ConfigStoreError> {
        let root = &self.storage_root;
        if create {
            Dir::create_ambient_dir_all(root, ambient_authority())
                .map_err(|err| io_error(root, &err))?;
        }
        Dir::open_ambient_dir(root, ambient_authority()).map_err(|err| io_error(root, &err))
    }
}

/// Renders the SSH client `Host` block for an environment.
#[must_use]
pub fn render_host_block(project: &ProjectConfig, use_ipv6: bool) -> String {
    let remote = &project.remote;
    let mut block = format!(
        "Host {}\n    HostName {}\n    User {}\n    Port {}\n    IdentityFile {}\n    IdentitiesOnly yes\n",
        remote.alias, remote.hostname, remote.user, remote.port, remote.identityfile
    );
    if use_ipv6 {
        block.push_str("    AddressFamily inet6\n");
    }
    block.push_str("    UserKnownHostsFile /dev/null\n    StrictHostKeyChecking no\n");
    block
}

/// What [`EnvironmentStore::register_host`] did to the SSH client
/// configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HostRegistration {
    /// A new block was appended.
    Added,
    /// The existing block already matched.
    Unchanged,
    /// A stale block owned by the alias was rewritten.
    Replaced {
        /// `HostName` of the block that was replaced, if it had one.
        previous: Option<String>,
    },
    /// The alias shares a `Host` line with other patterns and points
    /// elsewhere; the file was left untouched.
    Kept {
        /// `HostName` the existing block still points at.
        hostname: String,
    },
}

/// Line range of one `Host` section in an SSH client configuration.
struct HostBlock<'a> {
    start: usize,
    end: usize,
    shared: bool,
    hostname: Option<&'a str>,
}

impl HostBlock<'_> {
    fn text(&self, lines: &[&str]) -> String {
        lines
            .iter()
            .take(self.end)
            .skip(self.start)
            .fold(String::new(), |mut text, line| {
                text.push_str(line);
                text.push('\n');
                text
            })
    }

    fn replace_with(&self, lines: &[&str], rendered: &str) -> String {
        let mut updated = String::new();
        for line in lines.iter().take(self.start) {
            updated.push_str(line);
            updated.push('\n');
        }
        updated.push_str(rendered);
        let mut rest = lines.iter().skip(self.end).peekable();
        if rest.peek().is_some_and(|line| !line.trim().is_empty()) {
            updated.push('\n');
        }
        for line in rest {
            updated.push_str(line);
            updated.push('\n');
        }
        updated
    }
}

fn find_host_block<'a>(lines: &[&'a str], alias: &str) -> Option<HostBlock<'a>> {
    let start = lines.iter().position(|line| {
        host_patterns(line).is_some_and(|mut patterns| patterns.any(|pattern| pattern == alias))
    })?;
    let shared = lines
        .get(start)
        .and_then(|line| host_patterns(line))
        .is_some_and(|patterns| patterns.count() > 1);
    let next_section = lines
        .iter()
        .enumerate()
        .skip(start + 1)
        .find(|(_, line)| {
            directive(line).is_some_and(|(keyword, _)| {
                keyword.eq_ignore_ascii_case("host") || keyword.eq_ignore_ascii_case("match")
            })
        })
        .map_or(lines.len(), |(index, _)| index);
    // Blank and comment lines before the next section stay with it.
    let end = lines
        .iter()
        .enumerate()
        .take(next_section)
        .skip(start + 1)
        .rev()
        .find(|(_, line)| directive(line).is_some())
        .map_or(start + 1, |(index, _)| index + 1);
    let hostname = lines
        .iter()
        .take(end)
        .skip(start + 1)
        .find_map(|line| {
            directive(line)
                .filter(|(keyword, _)| keyword.eq_ignore_ascii_case("hostname"))
                .and_then(|(_, value)| value.split_whitespace().next())
        });
    Some(HostBlock {
        start,
        end,
        shared,
        hostname,
    })
}

/// Splits a configuration line into its keyword and arguments, skipping
/// blank lines and comments.
fn directive(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (keyword, rest) = trimmed
        .split_once(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or((trimmed, ""));
    Some((
        keyword,
        rest.trim_start_matches(|c: char| c.is_whitespace() || c == '='),
    ))
}

fn host_patterns(line: &str) -> Option<SplitWhitespace<'_>> {
    directive(line)
        .filter(|(keyword, _)| keyword.eq_ignore_ascii_case("host"))
        .map(|(_, patterns)| patterns.split_whitespace())
}

fn append_block(existing: &str, rendered: &str) -> String {
    let mut contents = existing.to_owned();
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    if !contents.is_empty() {
        contents.push('\n');
    }
    contents.push_str(rendered);
    contents
}

fn check_identity(identity: &str) -> Result<(), ConfigStoreError> {
    let path = expand_tilde(identity)
        .map_err(|err| unreadable_identity(Utf8Path::new(identity), err.to_string()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| unreadable_identity(&path, String::from("path is missing a file name")))?;
    let dir = Dir::open_ambient_dir(parent_of(&path), ambient_authority())
        .map_err(|err| unreadable_identity(&path, err.to_string()))?;
    let file = dir
        .open(file_name)
        .map_err(|err| unreadable_identity(&path, err.to_string()))?;
    let metadata = file
        .metadata()
        .map_err(|err| unreadable_identity(&path, err.to_string()))?;
    if !metadata.is_file() {
        return Err(unreadable_identity(&path, String::from("not a regular file")));
    }
    Ok(())
}

fn unreadable_identity(path: &Utf8Path, message: String) -> ConfigStoreError {
    ConfigStoreError::UnreadableIdentity {
        path: path.to_path_buf(),
        message,
    }
}

fn parent_of(path: &Utf8Path) -> &Utf8Path {
    path.parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."))
}

fn open_parent(path: &Utf8Path) -> Result<(Dir, &str), ConfigStoreError> {
    let parent = parent_of(path);
    let file_name = path.file_name().ok_or_else(|| ConfigStoreError::Io {
        path: path.to_path_buf(),
        message: String::from("path is missing a file name"),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    Ok((dir, file_name))
}

fn path_exists(path: &Utf8Path) -> Result<bool, ConfigStoreError> {
    let parent = parent_of(path);
    let Some(file_name) = path.file_name() else {
        return Ok(false);
    };
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir
            .try_exists(file_name)
            .map_err(|err| io_error(path, &err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error(parent, &err)),
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> ConfigStoreError {
    ConfigStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
