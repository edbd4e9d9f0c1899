//! Axum application for the control plane.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tracing::warn;

use camofleet_shared::{bridge_websocket, cors_layer};

use crate::config::WorkerConfig;
use crate::metrics::ControlMetrics;
use crate::models::{CreateSessionRequest, SessionDescriptor, WorkerStatus};
use crate::service::WorkerClientPool;
use crate::state::{AppState, SelectError};
use crate::urls::{build_public_ws_endpoint, build_worker_ws_endpoint};
use crate::vnc::apply_vnc_overrides;

pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

impl From<SelectError> for ApiError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::NotFound => Self::new(StatusCode::NOT_FOUND, "Worker not found"),
            SelectError::NoWorkers => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "No workers configured")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

/// Build the control-plane router.
pub fn create_app(state: Arc<AppState>) -> Router {
    let metrics_path = state.settings.metrics_endpoint.clone();
    Router::new()
        .route("/health", get(health))
        .route("/workers", get(list_workers))
        .route("/diagnostics", post(diagnostics))
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/:worker_name/:session_id",
            get(get_session).delete(delete_session),
        )
        .route(
            "/sessions/:worker_name/:session_id/touch",
            post(touch_session),
        )
        .route("/sessions/:worker_name/:session_id/ws", get(session_websocket))
        .route(&metrics_path, get(metrics))
        .layer(cors_layer(&state.settings.cors_origins))
        .with_state(state)
}

// ── Worker proxy plumbing ───────────────────────────────────────────────

enum ProxyError {
    /// The worker answered with an error status.
    Status { status: StatusCode, body: String },
    /// The worker could not be reached.
    Unreachable(String),
}

impl ProxyError {
    fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }
        )
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        match err {
            err if err.is_not_found() => Self::new(StatusCode::NOT_FOUND, "Session not found"),
            ProxyError::Status { status, body } => Self::new(status, body),
            ProxyError::Unreachable(detail) => Self::new(StatusCode::BAD_GATEWAY, detail),
        }
    }
}

/// Send one request to a worker, recording per-operation metrics.
async fn proxy_request(
    state: &AppState,
    worker: &WorkerConfig,
    operation: &str,
    builder: reqwest::RequestBuilder,
) -> Result<Value, ProxyError> {
    let started = Instant::now();
    let result = builder.send().await;
    let elapsed = started.elapsed().as_secs_f64();
    let metrics: &ControlMetrics = &state.metrics;

    let response = match result {
        Ok(response) => response,
        Err(err) => {
            metrics.record_error(&worker.name, operation, elapsed);
            return Err(ProxyError::Unreachable(format!(
                "worker {} unreachable: {err}",
                worker.name
            )));
        }
    };

    let status = response.status();
    if !status.is_success() {
        metrics.record_error(&worker.name, operation, elapsed);
        let body = response.text().await.unwrap_or_default();
        return Err(ProxyError::Status { status, body });
    }

    match response.json::<Value>().await {
        Ok(body) => {
            metrics.record_success(&worker.name, operation, elapsed);
            Ok(body)
        }
        Err(err) => {
            metrics.record_error(&worker.name, operation, elapsed);
            Err(ProxyError::Unreachable(format!(
                "worker {} returned an unreadable body: {err}",
                worker.name
            )))
        }
    }
}

/// Annotate a worker session payload with public URLs and VNC overrides.
fn decorate_session_body(
    state: &AppState,
    worker: &WorkerConfig,
    body: &mut Value,
) -> Result<(), ApiError> {
    let session_id = body
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_GATEWAY,
                format!("worker {} returned a session without an id", worker.name),
            )
        })?;

    let map = body.as_object_mut().ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_GATEWAY,
            format!("worker {} returned a malformed session", worker.name),
        )
    })?;

    map.insert(
        "ws_endpoint".into(),
        json!(build_public_ws_endpoint(
            &state.settings.public_api_prefix,
            &worker.name,
            &session_id
        )),
    );
    map.entry("browser").or_insert_with(|| json!("camoufox"));
    if !map.contains_key("vnc") {
        if let Some(vnc_info) = map.remove("vnc_info") {
            map.insert("vnc".into(), vnc_info);
        }
    }
    if let Some(vnc) = map.get("vnc").cloned() {
        map.insert("vnc".into(), apply_vnc_overrides(worker, Some(&vnc)));
    }
    if !map.contains_key("vnc_enabled") {
        let has_endpoint = |key: &str| {
            map.get("vnc")
                .and_then(|vnc| vnc.get(key))
                .and_then(Value::as_str)
                .map(|value| !value.is_empty())
                .unwrap_or(false)
        };
        let enabled = has_endpoint("http") || has_endpoint("ws");
        map.insert("vnc_enabled".into(), json!(enabled));
    }
    map.insert("worker".into(), json!(worker.name));
    Ok(())
}

fn into_descriptor(worker: &WorkerConfig, body: Value) -> Result<SessionDescriptor, ApiError> {
    serde_json::from_value(body).map_err(|err| {
        ApiError::new(
            StatusCode::BAD_GATEWAY,
            format!("worker {} returned an invalid session: {err}", worker.name),
        )
    })
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn fetch_worker_status(state: &AppState, worker: &WorkerConfig) -> WorkerStatus {
    let client = state.clients.client_for(worker);
    let request = client.get(WorkerClientPool::url_for(worker, "/health"));
    match proxy_request(state, worker, "health", request).await {
        Ok(detail) => {
            let healthy = detail.get("status").and_then(Value::as_str) == Some("ok");
            WorkerStatus {
                name: worker.name.clone(),
                healthy,
                detail,
                supports_vnc: worker.supports_vnc,
            }
        }
        Err(err) => {
            let detail = match err {
                ProxyError::Status { status, body } => {
                    json!({"error": format!("status {status}"), "body": body})
                }
                ProxyError::Unreachable(message) => json!({ "error": message }),
            };
            warn!(worker = %worker.name, ?detail, "worker unhealthy");
            WorkerStatus {
                name: worker.name.clone(),
                healthy: false,
                detail,
                supports_vnc: worker.supports_vnc,
            }
        }
    }
}

async fn gather_worker_status(state: &Arc<AppState>) -> Vec<WorkerStatus> {
    let workers = state.settings.workers.clone();
    futures::stream::iter(workers)
        .map(|worker| {
            let state = Arc::clone(state);
            async move { fetch_worker_status(&state, &worker).await }
        })
        .buffer_unordered(state.settings.list_sessions_concurrency)
        .collect()
        .await
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let statuses = gather_worker_status(&state).await;
    let healthy = !statuses.is_empty() && statuses.iter().all(|status| status.healthy);
    Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "workers": statuses,
    }))
}

async fn list_workers(State(state): State<Arc<AppState>>) -> Json<Vec<WorkerStatus>> {
    Json(gather_worker_status(&state).await)
}

/// Collect the network-probe reports each runner gathered at start-up and
/// reshape them into one fleet-wide document.
async fn diagnostics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let statuses = gather_worker_status(&state).await;
    let workers: Vec<Value> = statuses.into_iter().map(worker_diagnostics).collect();
    Json(json!({ "workers": workers }))
}

fn worker_diagnostics(status: WorkerStatus) -> Value {
    let mut notes: Vec<String> = Vec::new();
    if !status.healthy {
        notes.push("worker is unhealthy or unreachable".into());
    }

    let Some(diag) = status.detail.get("diagnostics") else {
        notes.push("worker did not report diagnostics".into());
        return json!({
            "name": status.name,
            "diagnostics_status": "disabled",
            "targets": [],
            "notes": notes,
        });
    };

    let diag_status = diag
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let targets: Vec<Value> = diag
        .get("results")
        .and_then(Value::as_object)
        .map(|results| {
            results
                .iter()
                .map(|(url, probes)| {
                    let probes: Vec<Value> = probes
                        .as_object()
                        .map(|map| {
                            map.iter()
                                .map(|(protocol, outcome)| {
                                    json!({
                                        "protocol": protocol,
                                        "status": outcome.get("status").cloned().unwrap_or(Value::Null),
                                        "detail": outcome.get("detail").cloned().unwrap_or(Value::Null),
                                    })
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    json!({ "url": url, "probes": probes })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "name": status.name,
        "diagnostics_status": diag_status,
        "targets": targets,
        "notes": notes,
    })
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionDescriptor>> {
    let workers = state.settings.workers.clone();
    let per_worker: Vec<Vec<SessionDescriptor>> = futures::stream::iter(workers)
        .map(|worker| {
            let state = Arc::clone(&state);
            async move {
                let client = state.clients.client_for(&worker);
                let request = client.get(WorkerClientPool::url_for(&worker, "/sessions"));
                let body = match proxy_request(&state, &worker, "list_sessions", request).await {
                    Ok(body) => body,
                    Err(err) => {
                        let detail = match err {
                            ProxyError::Status { status, .. } => format!("status {status}"),
                            ProxyError::Unreachable(message) => message,
                        };
                        warn!(worker = %worker.name, detail, "failed to query worker");
                        return Vec::new();
                    }
                };
                let Value::Array(items) = body else {
                    warn!(worker = %worker.name, "worker returned a non-list sessions body");
                    return Vec::new();
                };
                items
                    .into_iter()
                    .filter_map(|mut item| {
                        decorate_session_body(&state, &worker, &mut item).ok()?;
                        into_descriptor(&worker, item).ok()
                    })
                    .collect()
            }
        })
        .buffer_unordered(state.settings.list_sessions_concurrency)
        .collect()
        .await;
    Json(per_worker.into_iter().flatten().collect())
}

/// Reject payload values outside the documented bounds.
fn validate_create_request(request: &CreateSessionRequest) -> Result<(), ApiError> {
    if let Some(ttl) = request.idle_ttl_seconds {
        if !(30..=3600).contains(&ttl) {
            return Err(ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "idle_ttl_seconds must be within [30, 3600]",
            ));
        }
    }
    if let Some(url) = &request.start_url {
        if url.len() > 1024 {
            return Err(ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "start_url must be at most 1024 characters",
            ));
        }
    }
    if let Some(wait) = &request.start_url_wait {
        if !matches!(wait.as_str(), "none" | "domcontentloaded" | "load") {
            return Err(ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "start_url_wait must be one of none, domcontentloaded, load",
            ));
        }
    }
    Ok(())
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Response, ApiError> {
    validate_create_request(&request)?;
    let worker = state
        .pick_worker(request.worker.as_deref(), request.vnc)?
        .clone();

    let mut payload = serde_json::to_value(&request)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    if let Some(map) = payload.as_object_mut() {
        map.remove("worker");
    }

    let client = state.clients.client_for(&worker);
    let request_builder = client
        .post(WorkerClientPool::url_for(&worker, "/sessions"))
        .json(&payload);
    let mut body = proxy_request(&state, &worker, "create_session", request_builder)
        .await
        .map_err(ApiError::from)?;
    decorate_session_body(&state, &worker, &mut body)?;
    let descriptor = into_descriptor(&worker, body)?;
    Ok((StatusCode::CREATED, Json(descriptor)).into_response())
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path((worker_name, session_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let worker = state.pick_worker(Some(&worker_name), false)?.clone();
    let client = state.clients.client_for(&worker);
    let request = client.get(WorkerClientPool::url_for(
        &worker,
        &format!("/sessions/{session_id}"),
    ));
    let mut body = proxy_request(&state, &worker, "get_session", request)
        .await
        .map_err(ApiError::from)?;
    decorate_session_body(&state, &worker, &mut body)?;
    Ok(Json(into_descriptor(&worker, body)?).into_response())
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path((worker_name, session_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let worker = state.pick_worker(Some(&worker_name), false)?.clone();
    let client = state.clients.client_for(&worker);
    let request = client.delete(WorkerClientPool::url_for(
        &worker,
        &format!("/sessions/{session_id}"),
    ));
    let body = proxy_request(&state, &worker, "delete_session", request)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(body).into_response())
}

async fn touch_session(
    State(state): State<Arc<AppState>>,
    Path((worker_name, session_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let worker = state.pick_worker(Some(&worker_name), false)?.clone();
    let client = state.clients.client_for(&worker);
    let request = client.post(WorkerClientPool::url_for(
        &worker,
        &format!("/sessions/{session_id}/touch"),
    ));
    let mut body = proxy_request(&state, &worker, "touch_session", request)
        .await
        .map_err(ApiError::from)?;
    decorate_session_body(&state, &worker, &mut body)?;
    Ok(Json(into_descriptor(&worker, body)?).into_response())
}

/// Proxy WebSocket traffic between the public client and the chosen worker.
async fn session_websocket(
    ws: WebSocketUpgrade,
    Path((worker_name, session_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let worker = state.pick_worker(Some(&worker_name), false)?.clone();
    let Some(upstream_endpoint) = build_worker_ws_endpoint(&worker.url, &session_id) else {
        return Err(ApiError::new(
            StatusCode::BAD_GATEWAY,
            format!("worker {} has no usable WebSocket URL", worker.name),
        ));
    };

    Ok(ws.on_upgrade(move |socket| async move {
        let _guard = WebSocketGuard::open(&state, &worker.name);
        let context = format!("control bridge for {}/{}", worker.name, session_id);
        bridge_websocket(
            socket,
            || async move {
                connect_async(upstream_endpoint.as_str())
                    .await
                    .map(|(ws, _)| ws)
            },
            &context,
        )
        .await;
    }))
}

/// Keeps the per-worker `active_websockets` gauge honest even when the
/// bridge task is cancelled.
struct WebSocketGuard {
    state: Arc<AppState>,
    worker: String,
}

impl WebSocketGuard {
    fn open(state: &Arc<AppState>, worker: &str) -> Self {
        state.metrics.websocket_opened(worker);
        Self {
            state: Arc::clone(state),
            worker: worker.to_string(),
        }
    }
}

impl Drop for WebSocketGuard {
    fn drop(&mut self) {
        self.state.metrics.websocket_closed(&self.worker);
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder
        .encode(&state.metrics.registry.gather(), &mut buffer)
        .is_err()
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, "encode failure").into_response();
    }
    ([("content-type", prometheus::TEXT_FORMAT)], buffer).into_response()
}
