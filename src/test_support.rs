//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::backend::{
    Backend, BackendFuture, MachineHandle, MachineRequest, MachineStatus, ProviderError,
};
use crate::process::{CommandOutput, CommandRunner, ProcessError};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Clones share one script, so a runner moved onto a blocking thread still
/// reports to the test holding the original.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptedState>>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    responses: VecDeque<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

/// Records a single invocation made through a test runner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptedState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.with_state(|state| state.invocations.clone())
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        let output = CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        };
        self.with_state(|state| state.responses.push_back(output));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ProcessError> {
        self.with_state(|state| {
            state.invocations.push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
            state
                .responses
                .pop_front()
                .ok_or_else(|| ProcessError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
        })
    }
}

/// Stateful stand-in for the `mutagen` engine.
///
/// Understands `<kind> list|create|resume|terminate` and keeps sessions in
/// memory, so start/stop flows can be verified through `list`.
#[derive(Clone, Debug, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeEngineState>>,
}

#[derive(Debug, Default)]
struct FakeEngineState {
    sessions: Vec<FakeSession>,
    next_id: u32,
    failing_creates: BTreeSet<String>,
    failing_lists: BTreeSet<String>,
    failing_terminates: BTreeSet<String>,
    invocations: Vec<CommandInvocation>,
}

/// Session held by [`FakeEngine`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FakeSession {
    /// `sync` or `forward`.
    pub kind: String,
    /// Engine identifier.
    pub identifier: String,
    /// Session name.
    pub name: String,
    /// Whether the session is paused.
    pub paused: bool,
}

impl FakeEngine {
    /// Creates an engine with no sessions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeEngineState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Seeds a session as if an earlier invocation created it.
    pub fn insert_session(&self, kind: &str, name: &str, paused: bool) -> String {
        self.with_state(|state| state.insert(kind, name, paused))
    }

    /// Makes `create` fail for the session called `name`.
    pub fn fail_create(&self, name: &str) {
        self.with_state(|state| state.failing_creates.insert(name.to_owned()));
    }

    /// Makes `list` fail for `kind`.
    pub fn fail_list(&self, kind: &str) {
        self.with_state(|state| state.failing_lists.insert(kind.to_owned()));
    }

    /// Makes `terminate` fail for the session called `name`.
    pub fn fail_terminate(&self, name: &str) {
        self.with_state(|state| state.failing_terminates.insert(name.to_owned()));
    }

    /// Returns every session currently held.
    #[must_use]
    pub fn sessions(&self) -> Vec<FakeSession> {
        self.with_state(|state| state.sessions.clone())
    }

    /// Returns the names of held sessions of `kind`.
    #[must_use]
    pub fn session_names(&self, kind: &str) -> Vec<String> {
        self.with_state(|state| {
            state
                .sessions
                .iter()
                .filter(|session| session.kind == kind)
                .map(|session| session.name.clone())
                .collect()
        })
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.with_state(|state| state.invocations.clone())
    }

    /// Counts invocations whose first two arguments are `kind action`.
    #[must_use]
    pub fn count(&self, kind: &str, action: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|invocation| {
                invocation.args.first().is_some_and(|arg| arg == kind)
                    && invocation.args.get(1).is_some_and(|arg| arg == action)
            })
            .count()
    }
}

impl FakeEngineState {
    fn insert(&mut self, kind: &str, name: &str, paused: bool) -> String {
        self.next_id += 1;
        let identifier = format!("{kind}_{:04}", self.next_id);
        self.sessions.push(FakeSession {
            kind: kind.to_owned(),
            identifier: identifier.clone(),
            name: name.to_owned(),
            paused,
        });
        identifier
    }

    fn list(&self, kind: &str) -> CommandOutput {
        if self.failing_lists.contains(kind) {
            return failure("daemon unreachable");
        }
        let records = self
            .sessions
            .iter()
            .filter(|session| session.kind == kind)
            .map(|session| {
                json!({
                    "identifier": session.identifier,
                    "name": session.name,
                    "paused": session.paused,
                })
            })
            .collect::<Vec<_>>();
        success(serde_json::Value::Array(records).to_string())
    }

    fn create(&mut self, kind: &str, args: &[String]) -> CommandOutput {
        let Some(name) = args
            .iter()
            .position(|arg| arg == "--name")
            .and_then(|index| args.get(index + 1))
            .cloned()
        else {
            return failure("missing --name");
        };
        if self.failing_creates.contains(&name) {
            return failure("unable to connect to beta");
        }
        let identifier = self.insert(kind, &name, false);
        success(format!("Created session {identifier}\n"))
    }

    fn terminate(&mut self, identifier: &str) -> CommandOutput {
        let Some(index) = self
            .sessions
            .iter()
            .position(|session| session.identifier == identifier)
        else {
            return failure("unable to locate requested sessions");
        };
        let name = self.sessions.get(index).map(|session| session.name.clone());
        if name.is_some_and(|value| self.failing_terminates.contains(&value)) {
            return failure("termination failed");
        }
        self.sessions.remove(index);
        success(String::new())
    }

    fn resume(&mut self, identifier: &str) -> CommandOutput {
        match self
            .sessions
            .iter_mut()
            .find(|session| session.identifier == identifier)
        {
            Some(session) => {
                session.paused = false;
                success(String::new())
            }
            None => failure("unable to locate requested sessions"),
        }
    }
}

fn success(stdout: String) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout,
        stderr: String::new(),
    }
}

fn failure(message: &str) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: format!("Error: {message}"),
    }
}

impl CommandRunner for FakeEngine {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ProcessError> {
        let text: Vec<String> = args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        self.with_state(|state| {
            state.invocations.push(CommandInvocation {
                program: program.to_owned(),
                args: args.to_vec(),
            });
            let kind = text.first().map(String::as_str).unwrap_or_default();
            let action = text.get(1).map(String::as_str).unwrap_or_default();
            let operand = text.get(2).map(String::as_str).unwrap_or_default();
            Ok(match action {
                "list" => state.list(kind),
                "create" => state.create(kind, &text),
                "terminate" => state.terminate(operand),
                "resume" => state.resume(operand),
                _ => failure("unknown command"),
            })
        })
    }
}

/// Failure returned by [`StubBackend`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct StubFailure {
    /// Failure text.
    pub message: String,
    /// Whether the failure is a rejected credential.
    pub unauthorized: bool,
}

impl StubFailure {
    /// Creates an ordinary provider failure.
    #[must_use]
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_owned(),
            unauthorized: false,
        }
    }

    /// Creates a rejected-credential failure.
    #[must_use]
    pub fn unauthorized() -> Self {
        Self {
            message: String::from("401 unauthorized"),
            unauthorized: true,
        }
    }
}

impl ProviderError for StubFailure {
    fn is_unauthorized(&self) -> bool {
        self.unauthorized
    }
}

/// In-memory provisioning backend with scripted answers.
///
/// Machines report pending for a configurable number of polls before
/// initialising. Every call is recorded as `<operation> <app>`, with
/// `app` for application creation and `create` for booting the machine.
#[derive(Clone, Debug, Default)]
pub struct StubBackend {
    state: Arc<Mutex<StubBackendState>>,
}

#[derive(Debug, Default)]
struct StubBackendState {
    address: String,
    pending_polls: u32,
    polls: u32,
    terminal: Option<String>,
    fail_create_app: Option<StubFailure>,
    fail_create_machine: Option<StubFailure>,
    fail_allocate: Option<StubFailure>,
    fail_status: Option<StubFailure>,
    fail_delete: Option<StubFailure>,
    requests: Vec<MachineRequest>,
    calls: Vec<String>,
}

impl StubBackend {
    /// Creates a backend that hands out `address` and initialises machines
    /// after `pending_polls` pending answers.
    #[must_use]
    pub fn new(address: &str, pending_polls: u32) -> Self {
        let backend = Self::default();
        backend.with_state(|state| {
            state.address = address.to_owned();
            state.pending_polls = pending_polls;
        });
        backend
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut StubBackendState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Makes `create_app` fail, as when the name is already taken.
    pub fn fail_create_app(&self, failure: StubFailure) {
        self.with_state(|state| state.fail_create_app = Some(failure));
    }

    /// Makes `create_machine` fail after the application exists.
    pub fn fail_create_machine(&self, failure: StubFailure) {
        self.with_state(|state| state.fail_create_machine = Some(failure));
    }

    /// Makes `allocate_address` fail.
    pub fn fail_allocate(&self, failure: StubFailure) {
        self.with_state(|state| state.fail_allocate = Some(failure));
    }

    /// Makes `machine_status` fail.
    pub fn fail_status(&self, failure: StubFailure) {
        self.with_state(|state| state.fail_status = Some(failure));
    }

    /// Makes `delete_app` fail.
    pub fn fail_delete(&self, failure: StubFailure) {
        self.with_state(|state| state.fail_delete = Some(failure));
    }

    /// Makes machines report `state` instead of initialising.
    pub fn enter_terminal(&self, machine_state: &str) {
        self.with_state(|state| state.terminal = Some(machine_state.to_owned()));
    }

    /// Returns every recorded call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|state| state.calls.clone())
    }

    /// Returns every machine request received.
    #[must_use]
    pub fn requests(&self) -> Vec<MachineRequest> {
        self.with_state(|state| state.requests.clone())
    }

    /// Counts recorded calls of `operation`.
    #[must_use]
    pub fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.split(' ').next() == Some(operation))
            .count()
    }

    /// Number of status polls answered.
    #[must_use]
    pub fn polls(&self) -> u32 {
        self.with_state(|state| state.polls)
    }
}

impl Backend for StubBackend {
    type Error = StubFailure;

    fn create_app<'a>(&'a self, request: &'a MachineRequest) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.with_state(|state| {
                state.calls.push(format!("app {}", request.app_name));
                state.requests.push(request.clone());
                state.fail_create_app.clone().map_or(Ok(()), Err)
            })
        })
    }

    fn create_machine<'a>(
        &'a self,
        request: &'a MachineRequest,
    ) -> BackendFuture<'a, MachineHandle, Self::Error> {
        Box::pin(async move {
            self.with_state(|state| {
                state.calls.push(format!("create {}", request.app_name));
                state.fail_create_machine.clone().map_or_else(
                    || {
                        Ok(MachineHandle {
                            app_name: request.app_name.clone(),
                            machine_id: String::from("m-0001"),
                        })
                    },
                    Err,
                )
            })
        })
    }

    fn machine_status<'a>(
        &'a self,
        handle: &'a MachineHandle,
    ) -> BackendFuture<'a, MachineStatus, Self::Error> {
        Box::pin(async move {
            self.with_state(|state| {
                state.calls.push(format!("status {}", handle.app_name));
                state.polls += 1;
                if let Some(failure) = state.fail_status.clone() {
                    return Err(failure);
                }
                if let Some(terminal) = state.terminal.clone() {
                    return Ok(MachineStatus::Terminal(terminal));
                }
                if state.polls > state.pending_polls {
                    Ok(MachineStatus::Initialized)
                } else {
                    Ok(MachineStatus::Pending(String::from("created")))
                }
            })
        })
    }

    fn allocate_address<'a>(
        &'a self,
        app_name: &'a str,
        use_ipv6: bool,
    ) -> BackendFuture<'a, String, Self::Error> {
        Box::pin(async move {
            self.with_state(|state| {
                let family = if use_ipv6 { "v6" } else { "v4" };
                state.calls.push(format!("allocate {app_name} {family}"));
                state
                    .fail_allocate
                    .clone()
                    .map_or_else(|| Ok(state.address.clone()), Err)
            })
        })
    }

    fn delete_app<'a>(&'a self, app_name: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.with_state(|state| {
                state.calls.push(format!("delete {app_name}"));
                state.fail_delete.clone().map_or(Ok(()), Err)
            })
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Loopback HTTP server that answers exactly one request.
#[derive(Debug)]
pub struct OneShotServer {
    base: String,
    request: JoinHandle<String>,
}

impl OneShotServer {
    /// Binds a loopback port and answers the first request with `status`
    /// and `body`.
    ///
    /// # Errors
    ///
    /// Returns the bind failure.
    pub async fn start(status: u16, body: Vec<u8>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let request = tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return String::new();
            };
            let received = read_request(&mut stream).await;
            let mut response = format!(
                "HTTP/1.1 {status} Canned\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            )
            .into_bytes();
            response.extend_from_slice(&body);
            if let Err(err) = stream.write_all(&response).await {
                tracing::debug!(error = %err, "canned response not delivered");
            }
            received
        });
        Ok(Self { base, request })
    }

    /// Base URL, without a trailing slash.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Waits for the exchange and returns the raw request text.
    pub async fn received(self) -> String {
        self.request.await.unwrap_or_default()
    }
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let read = stream.read(&mut chunk).await.unwrap_or(0);
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(chunk.get(..read).unwrap_or_default());
        if request_complete(&buffer) {
            break;
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Reports whether `buffer` holds the head and the whole declared body, so
/// the connection is never closed with unread request bytes.
fn request_complete(buffer: &[u8]) -> bool {
    let text = String::from_utf8_lossy(buffer);
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return false;
    };
    let length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    body.len() >= length
}
