//! HTTP-level tests for the runner API surface.

use std::os::unix::fs::PermissionsExt;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use camofleet_runner::app::{create_app, AppState};
use camofleet_runner::config::RunnerSettings;
use camofleet_runner::sessions::SessionManager;

fn write_stub(dir: &std::path::Path) -> String {
    let path = dir.join("driver.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\necho 'ws://127.0.0.1:4444/stub'\nsleep 30\n",
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

fn test_settings(dir: &std::path::Path) -> RunnerSettings {
    RunnerSettings::load_from(vec![
        ("RUNNER_DRIVER_NODE_PATH".to_string(), write_stub(dir)),
        ("RUNNER_DRIVER_CLI_PATH".to_string(), "cli.js".to_string()),
        (
            "RUNNER_BROWSER_LAUNCH_TIMEOUT_SECONDS".to_string(),
            "5".to_string(),
        ),
    ])
    .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_version_and_checks() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let manager = SessionManager::new(settings.clone());
    let app = create_app(&settings, AppState::new(&settings, manager.clone()));

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["checks"].get("vnc").is_some());
    // Probes have not been started, so diagnostics stay pending.
    assert_eq!(body["diagnostics"]["status"], "pending");

    manager.close().await;
}

#[tokio::test]
async fn create_then_get_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let manager = SessionManager::new(settings.clone());
    let app = create_app(&settings, AppState::new(&settings, manager.clone()));

    let response = app
        .clone()
        .oneshot(
            Request::post("/sessions")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"headless": true}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["status"], "READY");
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(
            Request::get(format!("/sessions/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    // Non-timestamp fields must round trip unchanged.
    assert_eq!(fetched["id"], created["id"]);
    assert_eq!(fetched["ws_endpoint"], created["ws_endpoint"]);
    assert_eq!(fetched["headless"], created["headless"]);
    assert_eq!(fetched["vnc_info"], created["vnc_info"]);

    manager.close().await;
}

#[tokio::test]
async fn unknown_session_is_404_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let manager = SessionManager::new(settings.clone());
    let app = create_app(&settings, AppState::new(&settings, manager.clone()));

    for request in [
        Request::get("/sessions/nope").body(Body::empty()).unwrap(),
        Request::delete("/sessions/nope").body(Body::empty()).unwrap(),
        Request::post("/sessions/nope/touch")
            .body(Body::empty())
            .unwrap(),
    ] {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    manager.close().await;
}

#[tokio::test]
async fn out_of_range_ttl_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let manager = SessionManager::new(settings.clone());
    let app = create_app(&settings, AppState::new(&settings, manager.clone()));

    let response = app
        .oneshot(
            Request::post("/sessions")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"idle_ttl_seconds": 10}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    manager.close().await;
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let manager = SessionManager::new(settings.clone());
    let app = create_app(&settings, AppState::new(&settings, manager.clone()));

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    manager.close().await;
}
