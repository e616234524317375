//! Sync and port-forward session management over the `mutagen` engine.
//!
//! Sessions are addressed by name only. Every start looks the name up in the
//! engine first and reuses a match, and every stop terminates whatever the
//! engine currently reports under the project's name. Nothing about a
//! session is cached between invocations.

use std::ffi::OsString;

use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::names::SessionName;
use crate::process::{CommandOutput, CommandRunner};

mod config;
mod install;
mod types;

pub use config::{DEFAULT_IGNORES, ENGINE_PROGRAM, EngineConfig, SyncError};
pub use install::{
    ENGINE_VERSION, EngineInstaller, InstallError, InstallOutcome, host_platform, release_url,
};
pub use types::{
    SessionKind, SessionPlan, SessionRecord, StartedSessions, parse_created_identifier,
    parse_session_list,
};

const LIST_TEMPLATE: &str = "{{ json . }}";

/// Drives the engine's `create`, `list`, `resume` and `terminate` commands.
#[derive(Clone, Debug)]
pub struct SessionManager<R: CommandRunner> {
    config: EngineConfig,
    runner: R,
}

impl<R: CommandRunner> SessionManager<R> {
    /// Creates a manager invoking `config.program` through `runner`.
    #[must_use]
    pub const fn new(config: EngineConfig, runner: R) -> Self {
        Self { config, runner }
    }

    /// Returns the engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lists every session of `kind` known to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the engine cannot be run, exits non-zero,
    /// or prints output that is not a session list.
    pub fn list_sessions(&self, kind: SessionKind) -> Result<Vec<SessionRecord>, SyncError> {
        let args = [
            OsString::from(kind.command()),
            OsString::from("list"),
            OsString::from("--template"),
            OsString::from(LIST_TEMPLATE),
        ];
        let output = self.invoke(kind, "list", &args)?;
        parse_session_list(kind, &output.stdout)
    }

    /// Starts (or reuses) the bidirectional sync session `name`.
    ///
    /// The session ignores VCS metadata, [`DEFAULT_IGNORES`], the configured
    /// extra ignores and `exclude_patterns`, and resolves conflicts
    /// automatically in two-way-resolved mode.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when listing or creation fails.
    pub fn start_sync(
        &self,
        name: &str,
        local_path: &Utf8Path,
        target: &str,
        remote_path: &str,
        exclude_patterns: &[String],
    ) -> Result<String, SyncError> {
        if let Some(identifier) = self.reuse_existing(SessionKind::Sync, name)? {
            return Ok(identifier);
        }

        let mut args = vec![
            OsString::from("sync"),
            OsString::from("create"),
            OsString::from("--ignore-vcs"),
        ];
        let ignores = DEFAULT_IGNORES
            .iter()
            .map(|pattern| (*pattern).to_owned())
            .chain(self.config.extra_ignores.iter().cloned())
            .chain(exclude_patterns.iter().cloned());
        for pattern in ignores {
            args.push(OsString::from("-i"));
            args.push(OsString::from(pattern));
        }
        args.extend([
            OsString::from("--name"),
            OsString::from(name),
            OsString::from("--sync-mode"),
            OsString::from("two-way-resolved"),
            OsString::from(local_path.as_str()),
            OsString::from(format!("{target}:{remote_path}")),
        ]);

        self.create(SessionKind::Sync, name, &args)
    }

    /// Starts (or reuses) forward session `<name>-<index>` from a local
    /// loopback port to a remote loopback port.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when listing or creation fails.
    pub fn start_forward(
        &self,
        name: &SessionName,
        index: usize,
        local_port: u16,
        target: &str,
        remote_port: u16,
    ) -> Result<String, SyncError> {
        let forward_name = name.forward(index);
        if let Some(identifier) = self.reuse_existing(SessionKind::Forward, &forward_name)? {
            return Ok(identifier);
        }

        let args = [
            OsString::from("forward"),
            OsString::from("create"),
            OsString::from("--name"),
            OsString::from(&forward_name),
            OsString::from(format!("tcp:127.0.0.1:{local_port}")),
            OsString::from(format!("{target}:tcp:127.0.0.1:{remote_port}")),
        ];
        self.create(SessionKind::Forward, &forward_name, &args)
    }

    /// Starts the sync session and then one forward per rule, in order.
    ///
    /// Stops at the first failure without undoing earlier steps; callers
    /// roll back with [`SessionManager::stop_by_name`].
    ///
    /// # Errors
    ///
    /// Returns the first [`SyncError`] encountered.
    pub fn start_full_session(
        &self,
        name: &SessionName,
        local_path: &Utf8Path,
        plan: &SessionPlan,
    ) -> Result<StartedSessions, SyncError> {
        let sync = self.start_sync(
            name.as_str(),
            local_path,
            &plan.target,
            &plan.remote_path,
            &[],
        )?;
        let forwards = plan
            .forwards
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                self.start_forward(name, index, rule.local, &plan.target, rule.remote)
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!(session = %name, forwards = forwards.len(), "sessions started");
        Ok(StartedSessions { sync, forwards })
    }

    /// Terminates every sync and forward session belonging to `name`.
    ///
    /// Both families are always attempted. Per-session termination failures
    /// are logged and skipped; a family whose listing fails is reported in
    /// the returned [`SyncError::Stop`]. Finding nothing is success.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Stop`] when listing either family fails.
    pub fn stop_by_name(&self, name: &SessionName) -> Result<usize, SyncError> {
        let sync_result = self.stop_matching(SessionKind::Sync, |candidate| {
            candidate == name.as_str()
        });
        let forward_result = self.stop_matching(SessionKind::Forward, |candidate| {
            name.owns_forward(candidate)
        });

        match (sync_result, forward_result) {
            (Ok(synced), Ok(forwarded)) => Ok(synced + forwarded),
            (sync_outcome, forward_outcome) => Err(SyncError::Stop {
                sync: sync_outcome.err().map(Box::new),
                forward: forward_outcome.err().map(Box::new),
            }),
        }
    }

    fn stop_matching(
        &self,
        kind: SessionKind,
        matches: impl Fn(&str) -> bool,
    ) -> Result<usize, SyncError> {
        let sessions = self.list_sessions(kind)?;
        let mut terminated = 0;
        for session in sessions.iter().filter(|session| matches(&session.name)) {
            match self.terminate(kind, &session.identifier) {
                Ok(()) => terminated += 1,
                Err(err) => warn!(
                    kind = %kind,
                    session = %session.name,
                    identifier = %session.identifier,
                    error = %err,
                    "failed to terminate session; continuing"
                ),
            }
        }
        debug!(kind = %kind, terminated, "stopped sessions");
        Ok(terminated)
    }

    fn terminate(&self, kind: SessionKind, identifier: &str) -> Result<(), SyncError> {
        let args = [
            OsString::from(kind.command()),
            OsString::from("terminate"),
            OsString::from(identifier),
        ];
        self.invoke(kind, "terminate", &args).map(|_| ())
    }

    fn reuse_existing(&self, kind: SessionKind, name: &str) -> Result<Option<String>, SyncError> {
        let Some(existing) = self
            .list_sessions(kind)?
            .into_iter()
            .find(|session| session.name == name)
        else {
            return Ok(None);
        };

        if existing.paused {
            let args = [
                OsString::from(kind.command()),
                OsString::from("resume"),
                OsString::from(&existing.identifier),
            ];
            self.invoke(kind, "resume", &args)?;
        }
        debug!(kind = %kind, session = name, identifier = %existing.identifier, "reusing session");
        Ok(Some(existing.identifier))
    }

    fn create(&self, kind: SessionKind, name: &str, args: &[OsString]) -> Result<String, SyncError> {
        let output = self.invoke(kind, "create", args)?;
        if let Some(identifier) = parse_created_identifier(&output.stdout) {
            debug!(kind = %kind, session = name, identifier = %identifier, "created session");
            return Ok(identifier);
        }

        self.list_sessions(kind)?
            .into_iter()
            .find(|session| session.name == name)
            .map(|session| session.identifier)
            .ok_or_else(|| SyncError::Parse {
                action: format!("{kind} create"),
                message: format!("session {name} was not reported after creation"),
            })
    }

    fn invoke(
        &self,
        kind: SessionKind,
        action: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, SyncError> {
        let output = self.runner.run(&self.config.program, args)?;
        if output.is_success() {
            return Ok(output);
        }

        Err(SyncError::CommandFailure {
            program: self.config.program.clone(),
            action: format!("{kind} {action}"),
            status: output.code,
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}
