//! Control-plane API tests against mock workers.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

use camofleet_control::app::create_app;
use camofleet_control::config::ControlSettings;
use camofleet_control::state::AppState;

fn worker_session(id: &str, vnc_ws: Option<&str>) -> Value {
    json!({
        "id": id,
        "status": "READY",
        "created_at": "2026-01-01T00:00:00Z",
        "last_seen_at": "2026-01-01T00:00:05Z",
        "browser": "camoufox",
        "headless": false,
        "idle_ttl_seconds": 300,
        "labels": {},
        "worker_id": "worker-uuid",
        "vnc_enabled": vnc_ws.is_some(),
        "start_url_wait": "load",
        "ws_endpoint": format!("/sessions/{id}/ws"),
        "vnc": {
            "ws": vnc_ws,
            "http": null,
            "password_protected": false,
        },
    })
}

/// Serve a mock worker that records which names created sessions.
async fn spawn_mock_worker(name: &'static str, vnc_ws: Option<&'static str>) -> String {
    async fn health() -> Json<Value> {
        Json(json!({"status": "ok", "version": "0.1.0", "checks": {}}))
    }

    let list_vnc = vnc_ws;
    let list = move || async move { Json(json!([worker_session("sess-1", list_vnc)])) };

    let create_vnc = vnc_ws;
    let create = move |Json(_payload): Json<Value>| async move {
        (
            StatusCode::CREATED,
            Json(worker_session(&format!("sess-{name}"), create_vnc)),
        )
    };

    let get_vnc = vnc_ws;
    let get_session = move |axum::extract::Path(id): axum::extract::Path<String>| async move {
        if id.starts_with("sess-") {
            Json(worker_session(&id, get_vnc)).into_response()
        } else {
            (
                StatusCode::NOT_FOUND,
                Json(json!({"detail": "Session not found"})),
            )
                .into_response()
        }
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list).post(create))
        .route("/sessions/:id", get(get_session));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn control_state(workers_json: &str, prefix: &str) -> Arc<AppState> {
    let settings = ControlSettings::load_from(vec![
        ("CONTROL_WORKERS".to_string(), workers_json.to_string()),
        ("CONTROL_PUBLIC_API_PREFIX".to_string(), prefix.to_string()),
    ])
    .unwrap();
    AppState::new(settings).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_session(app: &Router, payload: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::post("/sessions")
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    (status, body_json(response).await)
}

#[tokio::test]
async fn round_robin_with_vnc_filter() {
    let url_a = spawn_mock_worker("a", None).await;
    let url_b = spawn_mock_worker("b", Some("ws://127.0.0.1:6901/websockify?token=6901")).await;
    let workers = format!(
        r#"[{{"name":"A","url":"{url_a}","supports_vnc":false}},
            {{"name":"B","url":"{url_b}","supports_vnc":true}}]"#
    );
    let app = create_app(control_state(&workers, "/"));

    let mut picks = Vec::new();
    for _ in 0..3 {
        let (status, body) = create_session(&app, r#"{"vnc": false}"#).await;
        assert_eq!(status, StatusCode::CREATED);
        picks.push(body["worker"].as_str().unwrap().to_string());
    }
    assert_eq!(picks, vec!["A", "B", "A"]);

    let (status, body) = create_session(&app, r#"{"vnc": true}"#).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["worker"], "B");
}

#[tokio::test]
async fn ws_endpoint_is_rewritten_with_public_prefix() {
    let url_b = spawn_mock_worker("1", None).await;
    let workers = format!(r#"[{{"name":"B","url":"{url_b}"}}]"#);
    let app = create_app(control_state(&workers, "/api"));

    let (status, body) = create_session(&app, "{}").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["ws_endpoint"], "/api/sessions/B/sess-1/ws");
}

#[tokio::test]
async fn vnc_urls_are_rewritten_through_templates() {
    let url_b = spawn_mock_worker("1", Some("ws://internal:6901/websockify?token=6901")).await;
    let workers = format!(
        r#"[{{"name":"B","url":"{url_b}","supports_vnc":true,"vnc_ws":"wss://edge-{{id}}.example"}}]"#
    );
    let app = create_app(control_state(&workers, "/"));

    let (status, body) = create_session(&app, r#"{"vnc": true}"#).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        body["vnc"]["ws"],
        "wss://edge-6901.example/websockify?token=6901"
    );
}

#[tokio::test]
async fn unknown_preferred_worker_is_404_without_fallback() {
    let url_a = spawn_mock_worker("a", None).await;
    let workers = format!(r#"[{{"name":"A","url":"{url_a}"}}]"#);
    let app = create_app(control_state(&workers, "/"));

    let (status, body) = create_session(&app, r#"{"worker": "ghost"}"#).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "Worker not found");
}

#[tokio::test]
async fn vnc_request_without_capable_workers_is_503() {
    let url_a = spawn_mock_worker("a", None).await;
    let workers = format!(r#"[{{"name":"A","url":"{url_a}","supports_vnc":false}}]"#);
    let app = create_app(control_state(&workers, "/"));

    let (status, body) = create_session(&app, r#"{"vnc": true}"#).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["detail"], "No workers configured");
}

#[tokio::test]
async fn list_skips_unreachable_workers() {
    let url_a = spawn_mock_worker("a", None).await;
    let workers = format!(
        r#"[{{"name":"A","url":"{url_a}"}},
            {{"name":"DOWN","url":"http://127.0.0.1:9"}}]"#
    );
    let app = create_app(control_state(&workers, "/"));

    let response = app
        .oneshot(Request::get("/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let sessions = body.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["worker"], "A");
}

#[tokio::test]
async fn health_degrades_when_any_worker_is_down() {
    let url_a = spawn_mock_worker("a", None).await;
    let workers = format!(
        r#"[{{"name":"A","url":"{url_a}"}},
            {{"name":"DOWN","url":"http://127.0.0.1:9"}}]"#
    );
    let app = create_app(control_state(&workers, "/"));

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["workers"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn diagnostics_reshapes_worker_probe_reports() {
    // Worker whose health carries a diagnostics report.
    async fn health_with_diagnostics() -> Json<Value> {
        Json(json!({
            "status": "ok",
            "version": "0.1.0",
            "checks": {"vnc": "ok"},
            "diagnostics": {
                "status": "complete",
                "results": {
                    "https://bot.sannysoft.com": {
                        "http2": {"status": "ok", "detail": "HTTP/2.0 200"},
                        "http3": {"status": "error", "detail": "connection refused"},
                    },
                },
            },
        }))
    }
    let worker_app = Router::new().route("/health", get(health_with_diagnostics));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let worker_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, worker_app).await.unwrap();
    });

    let workers = format!(
        r#"[{{"name":"runner-1","url":"http://{worker_addr}","supports_vnc":true}},
            {{"name":"runner-2","url":"http://127.0.0.1:9"}}]"#
    );
    let app = create_app(control_state(&workers, "/"));

    let response = app
        .oneshot(
            Request::post("/diagnostics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let reporting = body["workers"]
        .as_array()
        .unwrap()
        .iter()
        .find(|w| w["name"] == "runner-1")
        .unwrap();
    assert_eq!(reporting["diagnostics_status"], "complete");
    let probes = &reporting["targets"][0]["probes"];
    assert_eq!(probes[0]["protocol"], "http2");
    assert_eq!(probes[0]["status"], "ok");
    assert_eq!(probes[1]["protocol"], "http3");
    assert_eq!(probes[1]["status"], "error");

    let offline = body["workers"]
        .as_array()
        .unwrap()
        .iter()
        .find(|w| w["name"] == "runner-2")
        .unwrap();
    assert_eq!(offline["diagnostics_status"], "disabled");
    assert!(!offline["notes"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn get_session_translates_worker_404() {
    let url_a = spawn_mock_worker("a", None).await;
    let workers = format!(r#"[{{"name":"A","url":"{url_a}"}}]"#);
    let app = create_app(control_state(&workers, "/"));

    let response = app
        .oneshot(
            Request::get("/sessions/A/unknown")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "Session not found");
}

#[tokio::test]
async fn proxy_metrics_appear_after_traffic() {
    let url_a = spawn_mock_worker("a", None).await;
    let workers = format!(r#"[{{"name":"A","url":"{url_a}"}}]"#);
    let app = create_app(control_state(&workers, "/"));

    let (status, _) = create_session(&app, "{}").await;
    assert_eq!(status, StatusCode::CREATED);

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("proxy_success_total"));
    assert!(text.contains("create_session"));
}
