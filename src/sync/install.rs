//! Installs a pinned `mutagen` release into the `vessel` tools directory.
//!
//! The release archive carries the `mutagen` binary and the agent bundle it
//! copies to remote hosts; both are unpacked side by side.

use std::env::consts;
use std::ffi::OsString;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs::{Permissions, PermissionsExt};
use cap_std::fs_utf8::Dir;
use flate2::read::GzDecoder;
use reqwest::Client;
use tar::Archive;
use thiserror::Error;
use tokio::task;
use tracing::{debug, info, warn};

use super::config::ENGINE_PROGRAM;
use crate::config::VesselConfig;
use crate::process::CommandRunner;

/// Release installed when no engine is available.
pub const ENGINE_VERSION: &str = "0.15.1";

const EXECUTABLE_MODE: u32 = 0o755;

/// Errors raised while installing the engine.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum InstallError {
    /// Raised when no release exists for the running platform.
    #[error(
        "no mutagen {} release for {os}/{arch}; install it from https://mutagen.io or set \
         VESSEL_MUTAGEN_BIN",
        ENGINE_VERSION
    )]
    UnsupportedPlatform {
        /// Operating system reported by the standard library.
        os: &'static str,
        /// CPU architecture reported by the standard library.
        arch: &'static str,
    },
    /// Raised when the tools directory cannot be resolved.
    #[error("cannot resolve the vessel tools directory: {0}")]
    ToolsDir(String),
    /// Raised when the archive cannot be fetched.
    #[error("failed to download mutagen from {url}: {message}")]
    Download {
        /// Archive URL.
        url: String,
        /// Transport or status detail.
        message: String,
    },
    /// Raised when the archive cannot be unpacked.
    #[error("failed to unpack mutagen into {path}: {message}")]
    Unpack {
        /// Destination directory.
        path: Utf8PathBuf,
        /// Decoder or file system detail.
        message: String,
    },
    /// Raised when the unpacked archive holds no `mutagen` executable.
    #[error("the mutagen archive did not contain {path}")]
    MissingBinary {
        /// Expected executable location.
        path: Utf8PathBuf,
    },
}

/// Result of [`EngineInstaller::install`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstallOutcome {
    /// The executable was downloaded and unpacked.
    Installed(Utf8PathBuf),
    /// An executable was already present; nothing was fetched.
    AlreadyPresent(Utf8PathBuf),
}

impl InstallOutcome {
    /// Location of the executable.
    #[must_use]
    pub fn program(&self) -> &Utf8Path {
        match self {
            Self::Installed(path) | Self::AlreadyPresent(path) => path,
        }
    }
}

/// Release archive URL for `version` on `os`/`arch`, using upstream naming.
#[must_use]
pub fn release_url(version: &str, os: &str, arch: &str) -> String {
    format!(
        "https://github.com/mutagen-io/mutagen/releases/download/v{version}/mutagen_{os}_{arch}_v{version}.tar.gz"
    )
}

/// Maps the running platform onto upstream release names.
///
/// # Errors
///
/// Returns [`InstallError::UnsupportedPlatform`] for platforms upstream does
/// not publish a release for.
pub fn host_platform() -> Result<(&'static str, &'static str), InstallError> {
    let unsupported = InstallError::UnsupportedPlatform {
        os: consts::OS,
        arch: consts::ARCH,
    };
    let os = match consts::OS {
        "linux" => "linux",
        "macos" => "darwin",
        "freebsd" => "freebsd",
        _ => return Err(unsupported),
    };
    let arch = match consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "arm" => "arm",
        _ => return Err(unsupported),
    };
    Ok((os, arch))
}

/// Downloads and unpacks the engine into a tools directory.
#[derive(Clone, Debug)]
pub struct EngineInstaller {
    bin_dir: Utf8PathBuf,
    archive_url: String,
    client: Client,
}

impl EngineInstaller {
    /// Installs from `archive_url` into `bin_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Download`] when the HTTP client cannot be
    /// built.
    pub fn new(
        bin_dir: Utf8PathBuf,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, InstallError> {
        let archive_url = url.into();
        let client = Client::builder().timeout(timeout).build().map_err(|err| {
            InstallError::Download {
                url: archive_url.clone(),
                message: err.to_string(),
            }
        })?;
        Ok(Self {
            bin_dir,
            archive_url,
            client,
        })
    }

    /// Installer for the configured tools directory, fetching either
    /// `mutagen_download_url` or the pinned release for this platform.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::UnsupportedPlatform`] when no URL is
    /// configured and the platform has no release, and
    /// [`InstallError::ToolsDir`] when the tools directory cannot be
    /// resolved.
    pub fn from_config(config: &VesselConfig) -> Result<Self, InstallError> {
        let bin_dir = config
            .tools_dir()
            .map_err(|err| InstallError::ToolsDir(err.to_string()))?;
        let url = match config
            .mutagen_download_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
        {
            Some(url) => url.to_owned(),
            None => {
                let (os, arch) = host_platform()?;
                release_url(ENGINE_VERSION, os, arch)
            }
        };
        Self::new(bin_dir, url, config.http_timeout())
    }

    /// Where the executable lives once installed.
    #[must_use]
    pub fn program_path(&self) -> Utf8PathBuf {
        self.bin_dir.join(ENGINE_PROGRAM)
    }

    /// Installs the engine unless an executable is already present, then
    /// stops any running engine daemon so the next command starts the
    /// installed version.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError`] when the download, unpacking or the final
    /// check fails.
    pub async fn install<R>(&self, runner: R) -> Result<InstallOutcome, InstallError>
    where
        R: CommandRunner + Send + 'static,
    {
        let program = self.program_path();
        if program.is_file() {
            debug!(path = %program, "mutagen already installed");
            return Ok(InstallOutcome::AlreadyPresent(program));
        }

        info!(url = %self.archive_url, dir = %self.bin_dir, "downloading mutagen");
        let archive = self.download().await?;
        let bin_dir = self.bin_dir.clone();
        let installed = program.clone();
        task::spawn_blocking(move || {
            unpack(&archive, &bin_dir)?;
            stop_daemon(&runner, &installed);
            Ok::<_, InstallError>(())
        })
        .await
        .map_err(|err| InstallError::Unpack {
            path: self.bin_dir.clone(),
            message: err.to_string(),
        })??;

        info!(path = %program, version = ENGINE_VERSION, "installed mutagen");
        Ok(InstallOutcome::Installed(program))
    }

    async fn download(&self) -> Result<Vec<u8>, InstallError> {
        let failure = |message: String| InstallError::Download {
            url: self.archive_url.clone(),
            message,
        };
        let response = self
            .client
            .get(&self.archive_url)
            .send()
            .await
            .map_err(|err| failure(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failure(format!("server answered {status}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| failure(err.to_string()))?;
        Ok(body.to_vec())
    }
}

fn unpack(archive: &[u8], bin_dir: &Utf8Path) -> Result<(), InstallError> {
    let unpack_error = |err: &io::Error| InstallError::Unpack {
        path: bin_dir.to_path_buf(),
        message: err.to_string(),
    };
    Dir::create_ambient_dir_all(bin_dir, ambient_authority()).map_err(|err| unpack_error(&err))?;
    Archive::new(GzDecoder::new(archive))
        .unpack(bin_dir.as_std_path())
        .map_err(|err| unpack_error(&err))?;

    let dir = Dir::open_ambient_dir(bin_dir, ambient_authority()).map_err(|err| unpack_error(&err))?;
    if !dir.is_file(ENGINE_PROGRAM) {
        return Err(InstallError::MissingBinary {
            path: bin_dir.join(ENGINE_PROGRAM),
        });
    }
    dir.set_permissions(ENGINE_PROGRAM, Permissions::from_mode(EXECUTABLE_MODE))
        .map_err(|err| unpack_error(&err))?;
    Ok(())
}

fn stop_daemon<R: CommandRunner>(runner: &R, program: &Utf8Path) {
    let args = [OsString::from("daemon"), OsString::from("stop")];
    match runner.run(program.as_str(), &args) {
        Ok(output) if output.is_success() => debug!("stopped mutagen daemon"),
        Ok(output) => debug!(
            status = %output.status_text(),
            stderr = %output.stderr.trim(),
            "no mutagen daemon to stop"
        ),
        Err(err) => warn!(error = %err, "could not stop the mutagen daemon"),
    }
}

#[cfg(test)]
mod tests;
