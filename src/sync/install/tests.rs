//! Tests for installing the sync engine from a release archive.

use std::fs;
use std::os::unix::fs::PermissionsExt as _;

use flate2::Compression;
use flate2::write::GzEncoder;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::{OneShotServer, ScriptedRunner};

const TIMEOUT: Duration = Duration::from_secs(5);

struct ToolsDir {
    _tmp: TempDir,
    bin_dir: Utf8PathBuf,
}

#[fixture]
fn tools() -> ToolsDir {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
    ToolsDir {
        _tmp: tmp,
        bin_dir: root.join("state").join("bin"),
    }
}

fn release_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, contents) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(u64::try_from(contents.len()).unwrap_or(u64::MAX));
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *contents)
            .unwrap_or_else(|err| panic!("append {name}: {err}"));
    }
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .unwrap_or_else(|err| panic!("finish archive: {err}"))
}

async fn installer_for(tools: &ToolsDir, status: u16, body: Vec<u8>) -> (EngineInstaller, OneShotServer) {
    let server = OneShotServer::start(status, body)
        .await
        .unwrap_or_else(|err| panic!("server: {err}"));
    let url = format!("{}/mutagen_linux_amd64_v{ENGINE_VERSION}.tar.gz", server.base());
    let installer = EngineInstaller::new(tools.bin_dir.clone(), url, TIMEOUT)
        .unwrap_or_else(|err| panic!("installer: {err}"));
    (installer, server)
}

#[test]
fn release_url_follows_upstream_naming() {
    assert_eq!(
        release_url("0.15.1", "darwin", "arm64"),
        "https://github.com/mutagen-io/mutagen/releases/download/v0.15.1/mutagen_darwin_arm64_v0.15.1.tar.gz"
    );
}

#[rstest]
#[tokio::test]
async fn archive_is_unpacked_with_executable_mode(tools: ToolsDir) {
    let archive = release_archive(&[
        ("mutagen", b"#!/bin/sh\n".as_slice()),
        ("mutagen-agents.tar.gz", b"agents".as_slice()),
    ]);
    let (installer, server) = installer_for(&tools, 200, archive).await;
    let runner = ScriptedRunner::new();
    runner.push_success();

    let outcome = installer
        .install(runner.clone())
        .await
        .unwrap_or_else(|err| panic!("install: {err}"));

    let program = tools.bin_dir.join("mutagen");
    assert_eq!(outcome, InstallOutcome::Installed(program.clone()));
    let mode = fs::metadata(&program)
        .unwrap_or_else(|err| panic!("stat: {err}"))
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o755);
    assert!(tools.bin_dir.join("mutagen-agents.tar.gz").is_file());
    let commands: Vec<String> = runner
        .invocations()
        .iter()
        .map(|invocation| invocation.command_string())
        .collect();
    assert_eq!(commands, vec![format!("{program} daemon stop")]);
    assert!(server.received().await.starts_with("GET /mutagen_linux_amd64_v"));
}

#[rstest]
#[tokio::test]
async fn present_binary_is_not_downloaded_again(tools: ToolsDir) {
    fs::create_dir_all(&tools.bin_dir).unwrap_or_else(|err| panic!("mkdir: {err}"));
    fs::write(tools.bin_dir.join("mutagen"), "#!/bin/sh\n")
        .unwrap_or_else(|err| panic!("seed: {err}"));
    let installer = EngineInstaller::new(tools.bin_dir.clone(), "http://127.0.0.1:9/none", TIMEOUT)
        .unwrap_or_else(|err| panic!("installer: {err}"));
    let runner = ScriptedRunner::new();

    let outcome = installer
        .install(runner.clone())
        .await
        .unwrap_or_else(|err| panic!("install: {err}"));

    assert!(matches!(outcome, InstallOutcome::AlreadyPresent(_)));
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn missing_release_is_a_download_error(tools: ToolsDir) {
    let (installer, _server) = installer_for(&tools, 404, b"Not Found".to_vec()).await;

    let err = installer
        .install(ScriptedRunner::new())
        .await
        .err()
        .unwrap_or_else(|| panic!("install should fail"));

    let InstallError::Download { message, .. } = err else {
        panic!("expected a download error, got {err:?}");
    };
    assert!(message.contains("404"), "{message}");
    assert!(!tools.bin_dir.join("mutagen").exists());
}

#[rstest]
#[tokio::test]
async fn archive_without_engine_is_rejected(tools: ToolsDir) {
    let archive = release_archive(&[("README.md", b"nothing here".as_slice())]);
    let (installer, _server) = installer_for(&tools, 200, archive).await;
    let runner = ScriptedRunner::new();

    let err = installer.install(runner.clone()).await;

    assert_eq!(
        err,
        Err(InstallError::MissingBinary {
            path: tools.bin_dir.join("mutagen")
        })
    );
    assert!(runner.invocations().is_empty());
}
