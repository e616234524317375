//! Tests for opening forwarded ports in a browser.

use rstest::rstest;

use super::*;
use crate::test_support::ScriptedRunner;

fn project(forwarding: &[&str]) -> ProjectConfig {
    let mut project =
        ProjectConfig::for_new_environment("shop", "2a09::1", "/keys/shop/id_ed25519");
    project.forwarding = forwarding.iter().map(|rule| (*rule).to_owned()).collect();
    project
}

#[rstest]
#[case::single(&["8000:80"], "http://localhost:8000")]
#[case::first_wins(&["5173:5173", "8000:80"], "http://localhost:5173")]
fn url_uses_first_local_port(#[case] forwarding: &[&str], #[case] expected: &str) {
    let url = forwarded_url(&project(forwarding)).unwrap_or_else(|err| panic!("url: {err}"));

    assert_eq!(url, expected);
}

#[test]
fn project_without_forwards_has_no_url() {
    assert_eq!(
        forwarded_url(&project(&[])),
        Err(ProjectConfigError::NoForwarding)
    );
}

#[test]
fn opener_receives_the_url() {
    let runner = ScriptedRunner::new();
    runner.push_success();

    open_url(&runner, "xdg-open", "http://localhost:8000")
        .unwrap_or_else(|err| panic!("open: {err}"));

    let commands: Vec<String> = runner
        .invocations()
        .iter()
        .map(|invocation| invocation.command_string())
        .collect();
    assert_eq!(commands, vec!["xdg-open http://localhost:8000"]);
}

#[test]
fn failing_opener_is_reported() {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(3), "", "no method available for opening");

    let err = open_url(&runner, "xdg-open", "http://localhost:8000")
        .err()
        .unwrap_or_else(|| panic!("open should fail"));

    assert_eq!(
        err,
        BrowserError::Failed {
            program: String::from("xdg-open"),
            url: String::from("http://localhost:8000"),
            status: String::from("3"),
            stderr: String::from("no method available for opening"),
        }
    );
}
