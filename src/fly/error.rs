//! Error types for the Fly.io backend.

use thiserror::Error;

use crate::backend::{BackendError, ProviderError};

/// Errors raised by the Fly.io backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FlyBackendError {
    /// Raised when a request is missing a required field.
    #[error("invalid machine request: missing {0}")]
    Validation(String),
    /// Raised when the HTTP client cannot be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    /// Raised when the API rejects the bearer token.
    #[error("Fly.io rejected the access token (HTTP {status}) for {url}")]
    Unauthorized {
        /// HTTP status returned.
        status: u16,
        /// Request URL.
        url: String,
    },
    /// Raised when the API answers with an unexpected status.
    #[error("{method} {url} failed with HTTP {status}: {body}")]
    Status {
        /// HTTP method used.
        method: String,
        /// Request URL.
        url: String,
        /// HTTP status returned.
        status: u16,
        /// Response body, as text.
        body: String,
    },
    /// Raised when a request cannot be sent for reasons other than a timeout.
    #[error("request to {url} failed: {message}")]
    Http {
        /// Request URL.
        url: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when every attempt at a request timed out.
    #[error("request to {url} timed out after {attempts} attempts")]
    Timeout {
        /// Request URL.
        url: String,
        /// Attempts made.
        attempts: u32,
    },
    /// Raised when a response body does not match the expected shape.
    #[error("could not decode response from {url}: {message}")]
    Decode {
        /// Request URL.
        url: String,
        /// Decoder message.
        message: String,
    },
    /// Raised when a GraphQL response carries errors.
    #[error("GraphQL {operation} failed: {message}")]
    GraphQl {
        /// Operation name.
        operation: &'static str,
        /// Joined error messages.
        message: String,
    },
}

impl ProviderError for FlyBackendError {
    fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

impl From<BackendError> for FlyBackendError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}
