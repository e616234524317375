//! Local Machines API proxy run through `flyctl`.
//!
//! The default API host is `http://127.0.0.1:4280`, the address
//! `flyctl machine api-proxy` listens on. When nothing answers there the
//! proxy is started for the duration of one command and stopped afterwards.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time;
use tracing::{debug, info, warn};

use crate::readiness::{PollPolicy, Readiness, wait_until_ready};

/// Executable that provides the proxy.
pub const PROXY_PROGRAM: &str = "flyctl";

/// Arguments that start the proxy.
pub const PROXY_ARGS: [&str; 2] = ["machine", "api-proxy"];

/// Budget for the proxy to start listening.
pub const PROXY_STARTUP: PollPolicy = PollPolicy::new(Duration::from_millis(200), 10);

const DIAL_TIMEOUT: Duration = Duration::from_millis(200);

/// Errors raised while bringing up the proxy.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProxyError {
    /// Raised when the API host is not a usable URL.
    #[error("invalid api_host {host:?}: {message}")]
    InvalidHost {
        /// Configured host.
        host: String,
        /// Parser message.
        message: String,
    },
    /// Raised when `flyctl` cannot be located.
    #[error(
        "nothing is listening on {address} and {program} could not be located ({message}); \
         install flyctl, start `flyctl machine api-proxy` yourself or set VESSEL_API_HOST"
    )]
    Missing {
        /// Address the API host points at.
        address: SocketAddr,
        /// Program searched for.
        program: String,
        /// Lookup failure detail.
        message: String,
    },
    /// Raised when the proxy process cannot be started.
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the proxy never accepts connections.
    #[error("the Machines API proxy did not start listening on {address}: {stderr}")]
    NotListening {
        /// Address that was polled.
        address: SocketAddr,
        /// Whatever the proxy wrote to stderr.
        stderr: String,
    },
}

/// A proxy process started by `vessel`; killed when stopped or dropped.
#[derive(Debug)]
pub struct ApiProxy {
    child: Child,
    address: SocketAddr,
}

impl ApiProxy {
    /// Starts the proxy when `api_host` points at a loopback address nobody
    /// listens on. Returns `None` when no proxy is needed.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] when the host cannot be parsed or the proxy
    /// cannot be started.
    pub async fn ensure(
        api_host: &str,
        program: Option<&str>,
        startup: PollPolicy,
    ) -> Result<Option<Self>, ProxyError> {
        let Some(address) = loopback_address(api_host)? else {
            debug!(api_host, "API host is not local; no proxy needed");
            return Ok(None);
        };
        if is_listening(address).await {
            debug!(%address, "Machines API proxy already listening");
            return Ok(None);
        }

        let requested = program
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(PROXY_PROGRAM);
        let resolved = which::which(requested).map_err(|err| ProxyError::Missing {
            address,
            program: requested.to_owned(),
            message: err.to_string(),
        })?;
        Self::spawn(&resolved.to_string_lossy(), &PROXY_ARGS, address, startup)
            .await
            .map(Some)
    }

    /// Runs `program` and waits until `address` accepts connections.
    pub(crate) async fn spawn(
        program: &str,
        args: &[&str],
        address: SocketAddr,
        startup: PollPolicy,
    ) -> Result<Self, ProxyError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ProxyError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        debug!(program, %address, "waiting for the Machines API proxy");

        let outcome = wait_until_ready(startup, || async move {
            Ok::<_, Infallible>(if is_listening(address).await {
                Readiness::Ready
            } else {
                Readiness::Pending
            })
        })
        .await;

        if outcome.is_ok() {
            info!(%address, "started Machines API proxy");
            return Ok(Self { child, address });
        }
        if let Err(err) = child.start_kill() {
            debug!(error = %err, "proxy already exited");
        }
        let stderr = match child.wait_with_output().await {
            Ok(output) => String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            Err(err) => err.to_string(),
        };
        Err(ProxyError::NotListening { address, stderr })
    }

    /// Address the proxy listens on.
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Terminates the proxy and waits for it to exit.
    pub async fn stop(mut self) {
        if let Err(err) = self.child.kill().await {
            warn!(error = %err, "could not stop the Machines API proxy");
            return;
        }
        info!(address = %self.address, "stopped Machines API proxy");
    }
}

/// Resolves `api_host` to a socket address when it names this machine.
///
/// # Errors
///
/// Returns [`ProxyError::InvalidHost`] when the host is not a URL with a
/// known port.
pub fn loopback_address(api_host: &str) -> Result<Option<SocketAddr>, ProxyError> {
    let invalid = |message: String| ProxyError::InvalidHost {
        host: api_host.to_owned(),
        message,
    };
    let url = Url::parse(api_host).map_err(|err| invalid(err.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| invalid(String::from("missing host")))?
        .trim_start_matches('[')
        .trim_end_matches(']');
    let ip = if host.eq_ignore_ascii_case("localhost") {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        match host.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() => ip,
            _ => return Ok(None),
        }
    };
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid(String::from("missing port")))?;
    Ok(Some(SocketAddr::new(ip, port)))
}

async fn is_listening(address: SocketAddr) -> bool {
    matches!(
        time::timeout(DIAL_TIMEOUT, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests;
