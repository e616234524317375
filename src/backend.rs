//! Provisioning contract for remote development machines.
//!
//! The lifecycle coordinator only talks to this trait. [`crate::fly`]
//! implements it against Fly.io; tests substitute scripted backends.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Parameters required to create a new machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineRequest {
    /// Application name; also the unit deleted on teardown.
    pub app_name: String,
    /// Container image to boot.
    pub image: String,
    /// Region to place the machine in; `None` lets the backend choose.
    pub region: Option<String>,
    /// `authorized_keys` line installed for the login user.
    pub public_key: String,
    /// Organisation that owns the application.
    pub org: String,
}

impl MachineRequest {
    /// Validates the request, returning the first empty required field.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any required field is empty.
    pub fn validate(&self) -> Result<(), BackendError> {
        for (value, field) in [
            (&self.app_name, "app_name"),
            (&self.image, "image"),
            (&self.public_key, "public_key"),
            (&self.org, "org"),
        ] {
            if value.trim().is_empty() {
                return Err(BackendError::Validation(field.to_owned()));
            }
        }
        Ok(())
    }
}

/// Handle returned by a backend once a machine has been created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineHandle {
    /// Application the machine belongs to.
    pub app_name: String,
    /// Provider specific machine identifier.
    pub machine_id: String,
}

/// Coarse machine state as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MachineStatus {
    /// Booted and usable.
    Initialized,
    /// Still being created or started.
    Pending(String),
    /// Will never become usable (destroyed, failed).
    Terminal(String),
}

/// Errors raised by backend-independent validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Classification hooks every backend error type provides.
pub trait ProviderError: std::error::Error + Send + Sync + 'static {
    /// Returns `true` when the provider rejected the credential.
    fn is_unauthorized(&self) -> bool {
        false
    }
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by provisioning backends.
pub trait Backend {
    /// Provider specific error type returned by the backend.
    type Error: ProviderError;

    /// Creates the application that will own the machine.
    ///
    /// An error means the application was not created by this call; it may
    /// belong to someone else and must not be deleted in response.
    fn create_app<'a>(&'a self, request: &'a MachineRequest) -> BackendFuture<'a, (), Self::Error>;

    /// Boots one machine in an application created by
    /// [`Backend::create_app`].
    fn create_machine<'a>(
        &'a self,
        request: &'a MachineRequest,
    ) -> BackendFuture<'a, MachineHandle, Self::Error>;

    /// Queries the machine's current state once.
    fn machine_status<'a>(
        &'a self,
        handle: &'a MachineHandle,
    ) -> BackendFuture<'a, MachineStatus, Self::Error>;

    /// Allocates a public address for the application and returns it.
    fn allocate_address<'a>(
        &'a self,
        app_name: &'a str,
        use_ipv6: bool,
    ) -> BackendFuture<'a, String, Self::Error>;

    /// Deletes the application and everything in it. An application that no
    /// longer exists counts as deleted.
    fn delete_app<'a>(&'a self, app_name: &'a str) -> BackendFuture<'a, (), Self::Error>;
}
