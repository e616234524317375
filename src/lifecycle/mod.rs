//! Lifecycle coordination for one project's remote environment.
//!
//! The coordinator owns every transition of the environment:
//!
//! - `init` generates a keypair, creates and addresses a machine, waits for
//!   it to initialise, persists the descriptor and checks SSH reachability.
//! - `start` brings up the sync session and the forwards; `stop` takes them
//!   down again while leaving the machine running.
//! - `destroy` stops sessions, deletes the remote application and removes
//!   the local state.
//!
//! It is also the only place that decides whether a failure triggers
//! compensating cleanup. Cleanup failures are logged and never replace the
//! error that triggered them.

mod error;
mod status;

use std::cell::RefCell;
use std::convert::Infallible;
use std::future::Future;

use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::backend::{Backend, MachineHandle, MachineRequest, MachineStatus};
use crate::config::VesselConfig;
use crate::config_store::{EnvironmentStore, HostRegistration, KeyPaths};
use crate::keys::generate_keypair;
use crate::names::{SessionName, derive_session_name, slugify};
use crate::process::CommandRunner;
use crate::project::{DEFAULT_REMOTE_PORT, ProjectConfig};
use crate::readiness::{PollError, PollPolicy, Readiness, wait_until_ready};
use crate::sync::{SessionManager, SessionPlan, StartedSessions, SyncError};
use crate::transport::{ConnectionError, ConnectionStage, RemoteShell};

pub use error::{BoxedError, LifecycleError};
pub use status::EnvironmentStatus;

/// Settings that shape new environments and the polling budgets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LifecycleSettings {
    /// Image booted on new machines.
    pub image: String,
    /// Organisation owning new applications.
    pub org: String,
    /// Region for new machines; `None` lets the backend choose.
    pub region: Option<String>,
    /// Port the SSH daemon listens on inside new machines.
    pub remote_port: u16,
    /// Budget for machine initialisation.
    pub readiness: PollPolicy,
    /// Budget for SSH reachability after initialisation.
    pub reachability: PollPolicy,
}

impl LifecycleSettings {
    /// Derives settings from the global configuration.
    #[must_use]
    pub fn from_config(config: &VesselConfig) -> Self {
        Self {
            image: config.image.clone(),
            org: config.org.clone(),
            region: config.region.clone().filter(|region| !region.trim().is_empty()),
            remote_port: DEFAULT_REMOTE_PORT,
            readiness: PollPolicy::MACHINE_READINESS,
            reachability: PollPolicy::REACHABILITY,
        }
    }
}

/// Inputs to [`Lifecycle::init`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitRequest {
    /// Project name; slugified into the application name.
    pub name: String,
    /// Allocate an IPv6 address (`true`) or IPv4.
    pub use_ipv6: bool,
}

/// Result of a successful [`Lifecycle::init`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitOutcome {
    /// Persisted descriptor.
    pub project: ProjectConfig,
    /// Where the keypair was stored.
    pub keys: KeyPaths,
    /// What happened to the SSH client `Host` entry.
    pub host_entry: HostRegistration,
    /// Final environment state.
    pub status: EnvironmentStatus,
}

/// Result of a successful [`Lifecycle::start`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartOutcome {
    /// Canonical session name.
    pub name: SessionName,
    /// Identifiers of the running sessions.
    pub sessions: StartedSessions,
    /// Descriptor the sessions were started from.
    pub project: ProjectConfig,
}

/// Result of a successful [`Lifecycle::destroy`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DestroyOutcome {
    /// Application that was torn down.
    pub app_name: String,
    /// Whether the remote application was deleted.
    pub remote_deleted: bool,
    /// Final environment state.
    pub status: EnvironmentStatus,
}

/// Coordinates backend, sync engine, transport and local state.
#[derive(Debug)]
pub struct Lifecycle<B, E, S>
where
    E: CommandRunner,
    S: CommandRunner,
{
    backend: B,
    sessions: Result<SessionManager<E>, SyncError>,
    shell: RemoteShell<S>,
    store: EnvironmentStore,
    settings: LifecycleSettings,
}

impl<B, E, S> Lifecycle<B, E, S>
where
    B: Backend,
    E: CommandRunner,
    S: CommandRunner + Clone + Send + 'static,
{
    /// Creates a coordinator.
    ///
    /// `sessions` carries the engine discovery result: operations that need
    /// the engine report the stored setup failure, while `init`, `cmd` and
    /// `ssh` work without it.
    #[must_use]
    pub const fn new(
        backend: B,
        sessions: Result<SessionManager<E>, SyncError>,
        shell: RemoteShell<S>,
        store: EnvironmentStore,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            backend,
            sessions,
            shell,
            store,
            settings,
        }
    }

    /// Local state store.
    #[must_use]
    pub const fn store(&self) -> &EnvironmentStore {
        &self.store
    }

    /// Provisions a new environment and verifies it accepts SSH.
    ///
    /// Failures before the descriptor is persisted remove the
    /// per-environment directory, and delete the remote application once
    /// this call has created it. A rejected application create, such as a
    /// name already taken by another application, never deletes anything
    /// remote. A machine that initialises but never answers SSH keeps its
    /// descriptor and is reported as a connection failure.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyInitialised`] when local state
    /// exists, [`LifecycleError::Timeout`] when the machine never
    /// initialises, [`LifecycleError::Connection`] when it never becomes
    /// reachable, and provisioning, crypto or store errors otherwise.
    pub async fn init(&self, request: &InitRequest) -> Result<InitOutcome, LifecycleError> {
        let app = slugify(&request.name);
        if app.is_empty() {
            return Err(LifecycleError::Config(
                format!("project name {:?} has no usable characters", request.name).into(),
            ));
        }
        if self.store.project_exists()? {
            return Err(LifecycleError::AlreadyInitialised {
                path: self.store.project_file().to_path_buf(),
            });
        }
        if self.store.env_dir_exists(&app)? {
            return Err(LifecycleError::AlreadyInitialised {
                path: self.store.env_dir(&app),
            });
        }

        let keypair = generate_keypair()?;
        self.store.create_env_dir(&app)?;
        info!(app = %app, status = %EnvironmentStatus::Unprovisioned, "generated access key");

        let keys = match self.store.write_keypair(&app, &keypair) {
            Ok(keys) => keys,
            Err(err) => {
                self.abandon(&app, false).await;
                return Err(err.into());
            }
        };

        let machine = MachineRequest {
            app_name: app.clone(),
            image: self.settings.image.clone(),
            region: self.settings.region.clone(),
            public_key: keypair.public_key.clone(),
            org: self.settings.org.clone(),
        };
        info!(app = %app, status = %EnvironmentStatus::Provisioning, "creating application");
        if let Err(err) = self.backend.create_app(&machine).await {
            self.abandon(&app, false).await;
            return Err(LifecycleError::provisioning("create the application", err));
        }

        let hostname = match self.provision(&machine, request.use_ipv6).await {
            Ok(hostname) => hostname,
            Err(err) => {
                self.abandon(&app, true).await;
                return Err(err);
            }
        };

        let mut project =
            ProjectConfig::for_new_environment(&app, &hostname, keys.private_key.as_str());
        project.remote.port = self.settings.remote_port;
        let host_entry = match self.persist(&project, request.use_ipv6) {
            Ok(host_entry) => host_entry,
            Err(err) => {
                self.abandon(&app, true).await;
                return Err(err);
            }
        };
        info!(app = %app, status = %EnvironmentStatus::Ready, %hostname, "environment descriptor written");

        self.await_reachable(&project).await?;
        info!(app = %app, status = %EnvironmentStatus::Active, "environment reachable");
        Ok(InitOutcome {
            project,
            keys,
            host_entry,
            status: EnvironmentStatus::Active,
        })
    }

    /// Starts the sync session and every forward for the project.
    ///
    /// A partial start is rolled back before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Config`] for a missing or invalid
    /// descriptor or an unreadable private key, [`LifecycleError::Setup`] when the engine is missing and
    /// [`LifecycleError::Sync`] when a session cannot be started.
    pub fn start(&self, local_path: &Utf8Path) -> Result<StartOutcome, LifecycleError> {
        let project = self.store.read_ready_project()?;
        let sessions = self.sessions()?;
        let name = derive_session_name(&project.name);
        let plan = SessionPlan::from_project(&project)?;

        match sessions.start_full_session(&name, local_path, &plan) {
            Ok(started) => {
                info!(session = %name, forwards = started.forwards.len(), "environment sessions running");
                Ok(StartOutcome {
                    name,
                    sessions: started,
                    project,
                })
            }
            Err(err) => {
                if let Err(cleanup) = sessions.stop_by_name(&name) {
                    warn!(session = %name, error = %cleanup, "rollback of partially started sessions failed");
                }
                Err(err.into())
            }
        }
    }

    /// Stops every session belonging to the project; the machine keeps
    /// running. Returns the number of sessions terminated.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Sync`] carrying both the sync and forward
    /// failures when either family cannot be listed.
    pub fn stop(&self) -> Result<usize, LifecycleError> {
        let project = self.store.read_project()?;
        let name = derive_session_name(&project.name);
        let stopped = self.sessions()?.stop_by_name(&name)?;
        info!(session = %name, stopped, status = %EnvironmentStatus::Ready, "environment sessions stopped");
        Ok(stopped)
    }

    /// Waits for `shutdown` and then runs [`Lifecycle::stop`] exactly once.
    ///
    /// # Errors
    ///
    /// Returns the error from [`Lifecycle::stop`].
    pub async fn stop_on<F>(&self, shutdown: F) -> Result<usize, LifecycleError>
    where
        F: Future<Output = ()>,
    {
        shutdown.await;
        info!("shutdown requested; stopping sessions");
        self.stop()
    }

    /// Tears the environment down.
    ///
    /// Sessions are stopped best-effort. With `files_only` the remote
    /// application is left alone; otherwise it must be deleted before any
    /// local state is removed.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Config`] without a descriptor,
    /// [`LifecycleError::Provisioning`] when the remote delete fails, and
    /// [`LifecycleError::Store`] when local files cannot be removed.
    pub async fn destroy(&self, files_only: bool) -> Result<DestroyOutcome, LifecycleError> {
        let project = self.store.read_project()?;
        let app = project.name.clone();
        let name = derive_session_name(&app);

        match self.sessions() {
            Ok(sessions) => {
                if let Err(err) = sessions.stop_by_name(&name) {
                    warn!(session = %name, error = %err, "could not stop sessions before destroy");
                }
            }
            Err(err) => warn!(error = %err, "skipping session stop before destroy"),
        }

        if !files_only {
            self.backend
                .delete_app(&app)
                .await
                .map_err(|err| LifecycleError::provisioning("delete the remote application", err))?;
            info!(app = %app, "remote application deleted");
        }

        self.store.remove_project()?;
        self.store.remove_env_dir(&app)?;
        info!(app = %app, status = %EnvironmentStatus::Destroyed, "local state removed");
        Ok(DestroyOutcome {
            app_name: app,
            remote_deleted: !files_only,
            status: EnvironmentStatus::Destroyed,
        })
    }

    /// Runs `command` in the remote working directory and returns its exit
    /// status.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Config`] without a descriptor or a
    /// readable private key, [`LifecycleError::Connection`] when the
    /// environment cannot be reached and [`LifecycleError::Remote`] for invalid commands.
    pub async fn run_command(&self, command: &[String]) -> Result<i32, LifecycleError> {
        let project = self.store.read_ready_project()?;
        Ok(self.shell.run_command(&project, command).await?)
    }

    /// Opens an interactive shell that ends when the remote side exits or
    /// `cancel` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Config`] without a descriptor and
    /// [`LifecycleError::Connection`] or [`LifecycleError::Remote`] when the
    /// session fails.
    pub async fn open_shell<F>(&self, cancel: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = ()>,
    {
        let project = self.store.read_ready_project()?;
        Ok(self.shell.run_interactive(&project, cancel).await?)
    }

    fn sessions(&self) -> Result<&SessionManager<E>, LifecycleError> {
        self.sessions
            .as_ref()
            .map_err(|err| LifecycleError::from(err.clone()))
    }

    /// Boots the machine in the freshly created application, allocates its
    /// address and waits for it to initialise. Returns the address.
    async fn provision(
        &self,
        request: &MachineRequest,
        use_ipv6: bool,
    ) -> Result<String, LifecycleError> {
        debug!(app = %request.app_name, "creating machine");
        let handle = self
            .backend
            .create_machine(request)
            .await
            .map_err(|err| LifecycleError::provisioning("create the machine", err))?;
        let address = self
            .backend
            .allocate_address(&request.app_name, use_ipv6)
            .await
            .map_err(|err| LifecycleError::provisioning("allocate a public address", err))?;
        self.await_initialised(&handle).await?;
        Ok(address)
    }

    async fn await_initialised(&self, handle: &MachineHandle) -> Result<(), LifecycleError> {
        let backend = &self.backend;
        let outcome = wait_until_ready(self.settings.readiness, move || async move {
            backend
                .machine_status(handle)
                .await
                .map(|status| match status {
                    MachineStatus::Initialized => Readiness::Ready,
                    MachineStatus::Pending(state) => {
                        debug!(machine = %handle.machine_id, %state, "machine not ready");
                        Readiness::Pending
                    }
                    MachineStatus::Terminal(state) => Readiness::Failed(state),
                })
        })
        .await;

        match outcome {
            Ok(attempts) => {
                debug!(machine = %handle.machine_id, attempts, "machine initialised");
                Ok(())
            }
            Err(PollError::Timeout { attempts }) => Err(LifecycleError::Timeout {
                what: "machine",
                attempts,
            }),
            Err(PollError::Status(err)) => {
                Err(LifecycleError::provisioning("query machine status", err))
            }
            Err(PollError::Failed(state)) => Err(LifecycleError::Provisioning {
                step: "boot the machine",
                source: format!("machine entered state {state}").into(),
            }),
        }
    }

    fn persist(
        &self,
        project: &ProjectConfig,
        use_ipv6: bool,
    ) -> Result<HostRegistration, LifecycleError> {
        let host_entry = self.store.register_host(project, use_ipv6)?;
        match &host_entry {
            HostRegistration::Replaced { previous } => warn!(
                alias = %project.remote.alias,
                previous = previous.as_deref().unwrap_or("none"),
                "replaced stale SSH host entry"
            ),
            HostRegistration::Kept { hostname } => warn!(
                alias = %project.remote.alias,
                %hostname,
                "SSH host entry is shared with other patterns and still points elsewhere"
            ),
            HostRegistration::Added | HostRegistration::Unchanged => {}
        }
        self.store.write_project(project)?;
        Ok(host_entry)
    }

    async fn await_reachable(&self, project: &ProjectConfig) -> Result<(), LifecycleError> {
        let shell = &self.shell;
        let last_failure: RefCell<Option<ConnectionError>> = RefCell::new(None);
        let failure = &last_failure;
        let outcome = wait_until_ready(self.settings.reachability, move || async move {
            match shell.connect(project).await {
                Ok(()) => Ok::<_, Infallible>(Readiness::Ready),
                Err(err) => {
                    debug!(error = %err, "environment not reachable yet");
                    *failure.borrow_mut() = Some(err);
                    Ok(Readiness::Pending)
                }
            }
        })
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(PollError::Timeout { attempts }) => {
                let err = last_failure.take().unwrap_or_else(|| ConnectionError {
                    stage: ConnectionStage::Dial,
                    target: project.remote.hostname.clone(),
                    message: format!("no answer after {attempts} attempts"),
                });
                warn!(
                    app = %project.name,
                    status = %EnvironmentStatus::Unreachable,
                    error = %err,
                    "environment did not become reachable; descriptor kept"
                );
                Err(err.into())
            }
            Err(PollError::Status(never)) => match never {},
            Err(PollError::Failed(state)) => Err(LifecycleError::Connection(ConnectionError {
                stage: ConnectionStage::OpenSession,
                target: project.remote.hostname.clone(),
                message: state,
            })),
        }
    }

    /// Best-effort removal of everything `init` created so far.
    async fn abandon(&self, app: &str, remote_created: bool) {
        if remote_created {
            if let Err(err) = self.backend.delete_app(app).await {
                warn!(app, error = %err, "cleanup could not delete the remote application");
            }
        }
        if let Err(err) = self.store.remove_env_dir(app) {
            warn!(app, error = %err, "cleanup could not remove the environment directory");
        }
        info!(app, status = %EnvironmentStatus::Unprovisioned, "initialisation rolled back");
    }
}
