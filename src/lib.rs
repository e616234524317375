//! Core library for the Vessel remote development tool.
//!
//! A project is edited locally and executed on an ephemeral Fly.io machine.
//! The crate exposes the provisioning backend abstraction and its Fly.io
//! implementation, the `mutagen` session manager that keeps files and ports
//! in step, the SSH transport, and the lifecycle coordinator tying them
//! together (init → start → stop → destroy). Around them sit the helpers for
//! `vessel auth`, `vessel open`, the local Machines API proxy and the
//! `mutagen` installer.

pub mod auth;
pub mod backend;
pub mod browser;
pub mod config;
pub mod config_store;
pub mod fly;
pub mod keys;
pub mod lifecycle;
pub mod logging;
pub mod names;
pub mod process;
pub mod project;
pub mod readiness;
pub mod sync;
pub mod test_support;
pub mod transport;

pub use auth::{AuthError, AuthRequest, Credentials, authenticate};
pub use backend::{Backend, MachineHandle, MachineRequest, MachineStatus, ProviderError};
pub use browser::{BrowserError, forwarded_url, open_url};
pub use config::{ConfigError, VesselConfig};
pub use config_store::{ConfigStoreError, EnvironmentStore, HostRegistration, KeyPaths};
pub use fly::{ApiProxy, FlyBackend, FlyBackendError, Organization, ProxyError, Viewer};
pub use keys::{AccessKeypair, KeyError, generate_keypair};
pub use lifecycle::{
    DestroyOutcome, EnvironmentStatus, InitOutcome, InitRequest, Lifecycle, LifecycleError,
    LifecycleSettings, StartOutcome,
};
pub use logging::init_tracing;
pub use names::{SessionName, derive_session_name, slugify};
pub use process::{CommandOutput, CommandRunner, ProcessCommandRunner, ProcessError};
pub use project::{ProjectConfig, ProjectConfigError, RemoteConfig};
pub use readiness::{PollError, PollPolicy, Readiness, wait_until_ready};
pub use sync::{
    EngineConfig, EngineInstaller, InstallError, InstallOutcome, SessionManager, SessionPlan,
    StartedSessions, SyncError,
};
pub use transport::{
    ConnectionError, ConnectionStage, RemoteShell, TransportError, TransportSettings,
};
