//! Exercises the browser launcher against stub driver scripts.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use camofleet_runner::browser::BrowserLauncher;
use camofleet_runner::config::RunnerSettings;
use camofleet_runner::error::RunnerError;

fn write_stub(dir: &Path, body: &str) -> String {
    let path = dir.join("driver.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

fn settings_with_driver(node_path: &str) -> RunnerSettings {
    RunnerSettings::load_from(vec![
        ("RUNNER_DRIVER_NODE_PATH".to_string(), node_path.to_string()),
        ("RUNNER_DRIVER_CLI_PATH".to_string(), "cli.js".to_string()),
        ("RUNNER_BROWSER_LAUNCH_TIMEOUT_SECONDS".to_string(), "5".to_string()),
    ])
    .unwrap()
}

#[tokio::test]
async fn launch_reads_ws_endpoint_from_first_stdout_line() {
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(
        dir.path(),
        "echo 'ws://127.0.0.1:4444/stub  '\necho diagnostics\nsleep 5",
    );
    let launcher = BrowserLauncher::from_settings(&settings_with_driver(&stub));

    let mut server = launcher.launch(true, None, None).await.unwrap();
    assert_eq!(server.ws_endpoint, "ws://127.0.0.1:4444/stub");
    server.close().await;
    // Double close must be harmless.
    server.close().await;
}

#[tokio::test]
async fn launch_failure_surfaces_stderr_and_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub(dir.path(), "echo boom >&2\nexit 3");
    let launcher = BrowserLauncher::from_settings(&settings_with_driver(&stub));

    let err = launcher.launch(true, None, None).await.unwrap_err();
    match err {
        RunnerError::BrowserLaunch { code, message } => {
            assert_eq!(code.0, Some(3));
            assert!(message.contains("boom"), "stderr missing: {message}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn launch_passes_config_file_to_driver() {
    let dir = tempfile::tempdir().unwrap();
    // The stub extracts the --config=... path and echoes the configured
    // headless flag back as part of the endpoint.
    let stub = write_stub(
        dir.path(),
        r#"for arg in "$@"; do case "$arg" in --config=*) cfg="${arg#--config=}";; esac; done
grep -q '"headless":false' "$cfg" && echo 'ws://127.0.0.1:1/headful' || echo 'ws://127.0.0.1:1/headless'
sleep 5"#,
    );
    let launcher = BrowserLauncher::from_settings(&settings_with_driver(&stub));

    let mut server = launcher.launch(false, Some(":107"), None).await.unwrap();
    assert_eq!(server.ws_endpoint, "ws://127.0.0.1:1/headful");
    server.close().await;
}
