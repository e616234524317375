//! Unit tests for the `vessel` CLI binary implementation.

use super::*;
use rstest::rstest;
use vessel::{
    ConnectionError, ConnectionStage, EnvironmentStatus, KeyPaths, ProjectConfig, SessionName,
    StartedSessions, derive_session_name,
};

fn rendered(buffer: Vec<u8>) -> String {
    String::from_utf8(buffer).unwrap_or_else(|err| panic!("utf8: {err}"))
}

#[rstest]
#[case::yes("y\n", true)]
#[case::word("Yes\n", true)]
#[case::no("n\n", false)]
#[case::empty("", false)]
#[case::other("maybe\n", false)]
fn confirm_accepts_only_explicit_yes(#[case] input: &str, #[case] expected: bool) {
    let mut output = Vec::new();

    let answer = confirm(input.as_bytes(), &mut output, "Delete?")
        .unwrap_or_else(|err| panic!("confirm: {err}"));

    assert_eq!(answer, expected);
    assert_eq!(rendered(output), "Delete? [y/N] ");
}

#[test]
fn project_name_defaults_to_directory_name() {
    let name = default_project_name(Utf8Path::new("/home/me/code/My Shop"))
        .unwrap_or_else(|err| panic!("name: {err}"));

    assert_eq!(name, "My Shop");
}

#[test]
fn root_directory_has_no_project_name() {
    let err = default_project_name(Utf8Path::new("/"))
        .err()
        .unwrap_or_else(|| panic!("root should be rejected"));

    assert!(err.summary().contains("--name"));
}

fn connection_failure() -> CliError {
    CliError::Lifecycle(LifecycleError::Connection(ConnectionError {
        stage: ConnectionStage::Authenticate,
        target: String::from("vessel@2a09::1"),
        message: String::from("Permission denied (publickey)"),
    }))
}

#[test]
fn errors_print_summary_by_default() {
    let mut buffer = Vec::new();

    write_error(&mut buffer, &connection_failure(), false);

    let text = rendered(buffer);
    assert_eq!(
        text,
        "Error: could not reach the environment over SSH (authentication failed)\n"
    );
    assert!(!text.contains("Permission denied"));
}

#[test]
fn verbose_errors_print_full_detail() {
    let mut buffer = Vec::new();

    write_error(&mut buffer, &connection_failure(), true);

    assert!(rendered(buffer).contains("Permission denied (publickey)"));
}

#[test]
fn verbose_errors_walk_the_source_chain() {
    let err = CliError::Lifecycle(LifecycleError::Provisioning {
        step: "create the machine",
        source: Box::new(io::Error::other("connection reset")),
    });
    let mut buffer = Vec::new();

    write_error(&mut buffer, &err, true);

    let text = rendered(buffer);
    assert!(text.starts_with("Error: failed to create the machine"));
    assert!(text.contains("  caused by: connection reset"));
}

#[test]
fn auth_errors_are_summarised_verbatim() {
    let err = CliError::Auth(AuthError::NoToken {
        path: Utf8PathBuf::from("/home/dev/.fly/config.yml"),
    });
    let mut buffer = Vec::new();

    write_error(&mut buffer, &err, false);

    let text = rendered(buffer);
    assert!(text.contains("flyctl auth login"));
    assert!(text.contains("/home/dev/.fly/config.yml"));
}

fn project() -> ProjectConfig {
    ProjectConfig::for_new_environment("shop", "2a09::1", "/keys/shop/id_ed25519")
}

fn init_outcome(host_entry: HostRegistration) -> InitOutcome {
    InitOutcome {
        project: project(),
        keys: KeyPaths {
            private_key: Utf8PathBuf::from("/keys/shop/id_ed25519"),
            public_key: Utf8PathBuf::from("/keys/shop/id_ed25519.pub"),
        },
        host_entry,
        status: EnvironmentStatus::Active,
    }
}

#[rstest]
#[case::replaced(
    HostRegistration::Replaced { previous: Some(String::from("2a09::9")) },
    "it pointed at 2a09::9"
)]
#[case::kept(
    HostRegistration::Kept { hostname: String::from("2a09::9") },
    "still points at 2a09::9"
)]
fn init_summary_reports_host_entry_changes(
    #[case] host_entry: HostRegistration,
    #[case] expected: &str,
) {
    let mut buffer = Vec::new();

    write_init_summary(&mut buffer, &init_outcome(host_entry))
        .unwrap_or_else(|err| panic!("write: {err}"));

    let text = rendered(buffer);
    assert!(text.contains("Host vessel-shop"), "{text}");
    assert!(text.contains(expected), "{text}");
}

#[test]
fn init_summary_names_alias_and_next_step() {
    let outcome = init_outcome(HostRegistration::Added);
    let mut buffer = Vec::new();

    write_init_summary(&mut buffer, &outcome).unwrap_or_else(|err| panic!("write: {err}"));

    let text = rendered(buffer);
    assert!(text.contains("Environment shop is active at 2a09::1"));
    assert!(text.contains("ssh vessel-shop"));
    assert!(text.contains("vessel start"));
}

#[test]
fn start_summary_lists_each_forward() {
    let name: SessionName = derive_session_name("shop");
    let outcome = StartOutcome {
        name,
        sessions: StartedSessions {
            sync: String::from("sync_0001"),
            forwards: vec![String::from("forward_0002")],
        },
        project: project(),
    };
    let mut buffer = Vec::new();

    write_start_summary(&mut buffer, &outcome).unwrap_or_else(|err| panic!("write: {err}"));

    assert_eq!(
        rendered(buffer),
        "Sync session vessel-shop running (sync_0001)\nForwarding 8000:80 (forward_0002)\n"
    );
}

#[rstest]
#[case::remote(true, "Environment shop deleted")]
#[case::files_only(false, "remote application was left running")]
fn destroy_summary_mentions_ssh_entry(#[case] remote_deleted: bool, #[case] expected: &str) {
    let outcome = DestroyOutcome {
        app_name: String::from("shop"),
        remote_deleted,
        status: EnvironmentStatus::Destroyed,
    };
    let mut buffer = Vec::new();

    write_destroy_summary(&mut buffer, &outcome, "vessel-shop")
        .unwrap_or_else(|err| panic!("write: {err}"));

    let text = rendered(buffer);
    assert!(text.contains(expected));
    assert!(text.contains("`Host vessel-shop`"));
}
