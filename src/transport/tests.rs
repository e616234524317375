//! Tests for staged connections and remote command rendering.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use rstest::rstest;
use tempfile::TempDir;
use tokio::net::TcpListener;

use super::*;
use crate::test_support::ScriptedRunner;

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let port = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"))
        .port();
    (listener, port)
}

fn descriptor(port: u16) -> ProjectConfig {
    let mut config = ProjectConfig::for_new_environment("shop", "127.0.0.1", "/keys/id_ed25519");
    config.remote.port = port;
    config
}

fn shell(runner: ScriptedRunner) -> RemoteShell<ScriptedRunner> {
    RemoteShell::new(runner, TransportSettings::new(Duration::from_secs(2)))
}

fn args_of(runner: &ScriptedRunner, index: usize) -> Vec<String> {
    runner
        .invocations()
        .get(index)
        .unwrap_or_else(|| panic!("missing invocation {index}"))
        .args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn reachability_check_runs_true_in_batch_mode() {
    let (_listener, port) = listener().await;
    let runner = ScriptedRunner::new();
    runner.push_success();
    let transport = shell(runner.clone());

    assert!(transport.test_connection(&descriptor(port)).await);

    let args = args_of(&runner, 0);
    assert!(args.contains(&String::from("BatchMode=yes")));
    assert!(args.contains(&String::from("IdentitiesOnly=yes")));
    assert!(args.contains(&String::from("/keys/id_ed25519")));
    assert_eq!(
        args.iter().rev().take(2).cloned().collect::<Vec<_>>(),
        ["true", "vessel@127.0.0.1"]
    );
}

#[tokio::test]
async fn refused_dial_fails_at_dial_stage() {
    let (listener, port) = listener().await;
    drop(listener);
    let runner = ScriptedRunner::new();
    let transport = shell(runner.clone());

    let err = transport
        .connect(&descriptor(port))
        .await
        .err()
        .unwrap_or_else(|| panic!("dial should fail"));

    assert_eq!(err.stage, ConnectionStage::Dial);
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[case::rejected_key(
    "vessel@127.0.0.1: Permission denied (publickey).",
    ConnectionStage::Authenticate
)]
#[case::reset("kex_exchange_identification: Connection reset by peer", ConnectionStage::OpenSession)]
#[tokio::test(flavor = "current_thread")]
async fn client_failures_are_staged(#[case] stderr: &str, #[case] stage: ConnectionStage) {
    let (_listener, port) = listener().await;
    let runner = ScriptedRunner::new();
    runner.push_output(Some(255), "", stderr);
    let transport = shell(runner);

    let err = transport
        .connect(&descriptor(port))
        .await
        .err()
        .unwrap_or_else(|| panic!("check should fail"));

    assert_eq!(err.stage, stage);
    assert_eq!(err.message, stderr);
}

#[tokio::test]
async fn run_command_changes_directory_and_returns_status() {
    let (_listener, port) = listener().await;
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_output(Some(3), "", "");
    let transport = shell(runner.clone());

    let code = transport
        .run_command(
            &descriptor(port),
            &[String::from("echo"), String::from("hello world")],
        )
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert_eq!(code, 3);
    let args = args_of(&runner, 1);
    assert_eq!(
        args.last().map(String::as_str),
        Some("cd /home/vessel/app && echo 'hello world'")
    );
    assert!(!args.contains(&String::from("BatchMode=yes")));
}

#[tokio::test]
async fn run_command_rejects_control_characters_before_connecting() {
    let runner = ScriptedRunner::new();
    let transport = shell(runner.clone());

    let result = transport
        .run_command(&descriptor(22), &[String::from("echo\nrm")])
        .await;

    assert!(matches!(result, Err(TransportError::InvalidCommand { .. })));
    assert!(runner.invocations().is_empty());
}

#[tokio::test]
async fn client_failure_during_command_is_a_connection_error() {
    let (_listener, port) = listener().await;
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_output(Some(255), "", "Connection closed by remote host");
    let transport = shell(runner);

    let result = transport
        .run_command(&descriptor(port), &[String::from("ls")])
        .await;

    assert!(matches!(
        result,
        Err(TransportError::Connection(ConnectionError {
            stage: ConnectionStage::OpenSession,
            ..
        }))
    ));
}

#[rstest]
#[case::plain(&["ls", "-la"], "ls -la")]
#[case::quoted(&["echo", "a b", "c'd"], r"echo 'a b' 'c'\''d'")]
fn commands_are_escaped_per_argument(#[case] args: &[&str], #[case] expected: &str) {
    let owned: Vec<String> = args.iter().map(|arg| (*arg).to_owned()).collect();

    assert_eq!(render_command(&owned), expected);
}

fn fake_client(dir: &TempDir, body: &str) -> String {
    let path = dir.path().join("fake-ssh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap_or_else(|err| panic!("write: {err}"));
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .unwrap_or_else(|err| panic!("chmod: {err}"));
    path.to_string_lossy().into_owned()
}

#[rstest]
#[case::clean("exit 0")]
#[case::interrupted("exit 130")]
#[tokio::test(flavor = "current_thread")]
async fn interactive_exit_codes_treated_as_clean(#[case] body: &str) {
    let (_listener, port) = listener().await;
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let runner = ScriptedRunner::new();
    runner.push_success();
    let settings =
        TransportSettings::new(Duration::from_secs(2)).with_program(fake_client(&dir, body));
    let transport = RemoteShell::new(runner, settings);

    let result = transport
        .run_interactive(&descriptor(port), std::future::pending())
        .await;

    assert_eq!(result, Ok(()));
}

#[tokio::test]
async fn interactive_failure_reports_exit_status() {
    let (_listener, port) = listener().await;
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let runner = ScriptedRunner::new();
    runner.push_success();
    let settings =
        TransportSettings::new(Duration::from_secs(2)).with_program(fake_client(&dir, "exit 2"));
    let transport = RemoteShell::new(runner, settings);

    let result = transport
        .run_interactive(&descriptor(port), std::future::pending())
        .await;

    assert_eq!(result, Err(TransportError::Exited { code: 2 }));
}

#[tokio::test]
async fn cancellation_stops_interactive_session() {
    let (_listener, port) = listener().await;
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let runner = ScriptedRunner::new();
    runner.push_success();
    let settings = TransportSettings::new(Duration::from_secs(2))
        .with_program(fake_client(&dir, "sleep 30"));
    let transport = RemoteShell::new(runner, settings);

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        transport.run_interactive(
            &descriptor(port),
            tokio::time::sleep(Duration::from_millis(50)),
        ),
    )
    .await
    .unwrap_or_else(|_| panic!("cancellation did not end the session"));

    assert_eq!(outcome, Ok(()));
}

#[derive(Clone, Debug)]
struct SlowRunner {
    delay: Duration,
}

impl CommandRunner for SlowRunner {
    fn run(&self, _program: &str, _args: &[OsString]) -> Result<CommandOutput, ProcessError> {
        std::thread::sleep(self.delay);
        Ok(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

#[tokio::test]
async fn slow_client_does_not_stall_the_runtime() {
    let (_listener, port) = listener().await;
    let transport = RemoteShell::new(
        SlowRunner {
            delay: Duration::from_millis(500),
        },
        TransportSettings::new(Duration::from_secs(2)),
    );
    let target = descriptor(port);

    let timer_fired_first = tokio::select! {
        biased;
        () = tokio::time::sleep(Duration::from_millis(50)) => true,
        result = transport.connect(&target) => {
            result.unwrap_or_else(|err| panic!("connect: {err}"));
            false
        }
    };

    assert!(timer_fired_first, "the reachability check held the runtime thread");
}
