//! Failures raised by the remote shell transport.

use std::fmt;

use thiserror::Error;

use crate::process::ProcessError;

/// Stage at which a connection attempt failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStage {
    /// The TCP connection could not be established.
    Dial,
    /// The server refused the credential.
    Authenticate,
    /// Authentication succeeded but no session could be opened.
    OpenSession,
}

impl fmt::Display for ConnectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dial => "dial",
            Self::Authenticate => "authentication",
            Self::OpenSession => "session setup",
        })
    }
}

/// A connection attempt that did not reach a usable session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("SSH {stage} failed for {target}: {message}")]
pub struct ConnectionError {
    /// Stage that failed.
    pub stage: ConnectionStage,
    /// `user@host:port` being contacted.
    pub target: String,
    /// Underlying failure.
    pub message: String,
}

/// Errors raised while running remote commands or shells.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// The connection could not be established.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// A command argument contains characters that cannot be sent safely.
    #[error("command argument contains control characters: {argument:?}")]
    InvalidCommand {
        /// Offending argument.
        argument: String,
    },
    /// The local SSH client could not be run.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// The remote side ended without reporting an exit status.
    #[error("remote session ended without an exit status")]
    Terminated,
    /// An interactive session exited with a failing status.
    #[error("interactive session exited with status {code}")]
    Exited {
        /// Remote exit status.
        code: i32,
    },
}
