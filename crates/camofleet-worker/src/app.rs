//! Axum application for the worker service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tracing::warn;
use uuid::Uuid;

use camofleet_shared::{bridge_websocket, cors_layer};

use crate::config::WorkerSettings;
use crate::models::{to_worker_detail, HealthResponse, SessionCreateRequest, SessionDeleteResponse};
use crate::runner_client::{RunnerClient, RunnerClientError};

/// State shared between request handlers.
pub struct AppState {
    pub settings: WorkerSettings,
    pub runner: RunnerClient,
    pub registry: Registry,
    /// Minted once per process; identifies this worker in descriptors.
    pub worker_id: String,
}

impl AppState {
    pub fn new(settings: WorkerSettings) -> Result<Self, reqwest::Error> {
        let runner = RunnerClient::new(
            &settings.runner_base_url,
            Duration::from_secs_f64(settings.request_timeout),
        )?;
        Ok(Self {
            settings,
            runner,
            registry: Registry::new(),
            worker_id: Uuid::new_v4().to_string(),
        })
    }
}

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

impl From<RunnerClientError> for ApiError {
    fn from(err: RunnerClientError) -> Self {
        match err {
            err if err.is_not_found() => {
                Self::new(StatusCode::NOT_FOUND, "Session not found")
            }
            RunnerClientError::Status { status, body } => Self::new(status, body),
            RunnerClientError::Transport(err) => {
                Self::new(StatusCode::BAD_GATEWAY, format!("runner unreachable: {err}"))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

/// Build the worker router.
pub fn create_app(state: Arc<AppState>) -> Router {
    let metrics_path = state.settings.metrics_endpoint.clone();
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/:session_id",
            get(get_session).delete(delete_session),
        )
        .route("/sessions/:session_id/touch", post(touch_session))
        .route("/sessions/:session_id/ws", get(session_websocket))
        .route(&metrics_path, get(metrics))
        .layer(cors_layer(&state.settings.cors_origins))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (status, checks, diagnostics) = match state.runner.health().await {
        Ok(payload) => {
            let status = payload
                .get("status")
                .and_then(|value| value.as_str())
                .unwrap_or("unknown")
                .to_string();
            let checks = payload
                .get("checks")
                .and_then(|value| value.as_object())
                .map(|map| {
                    map.iter()
                        .map(|(key, value)| {
                            (key.clone(), value.as_str().unwrap_or_default().to_string())
                        })
                        .collect()
                })
                .unwrap_or_default();
            let diagnostics = payload.get("diagnostics").cloned();
            (status, checks, diagnostics)
        }
        Err(err) => {
            warn!(error = %err, "runner health check failed");
            (
                "degraded".to_string(),
                HashMap::from([("runner".to_string(), "unreachable".to_string())]),
                None,
            )
        }
    };
    Json(HealthResponse {
        status,
        version: camofleet_shared::VERSION.into(),
        checks,
        diagnostics,
    })
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let sessions = state.runner.list_sessions().await?;
    let details: Vec<_> = sessions
        .into_iter()
        .map(|item| to_worker_detail(&state.worker_id, item))
        .collect();
    Ok(Json(details).into_response())
}

/// Reject payload values outside the documented bounds.
fn validate_create_request(request: &SessionCreateRequest) -> Result<(), ApiError> {
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
    Json(request): Json<SessionCreateRequest>,
) -> Result<Response, ApiError> {
    if request.vnc && !state.settings.supports_vnc {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "VNC is not supported by this worker",
        ));
    }
    validate_create_request(&request)?;

    let defaults = &state.settings.session_defaults;
    let mut payload = serde_json::Map::new();
    payload.insert(
        "headless".into(),
        json!(request.headless.unwrap_or(defaults.headless)),
    );
    payload.insert(
        "idle_ttl_seconds".into(),
        json!(request.idle_ttl_seconds.unwrap_or(defaults.idle_ttl_seconds)),
    );
    if let Some(start_url) = &request.start_url {
        payload.insert("start_url".into(), json!(start_url));
    }
    if let Some(wait) = &request.start_url_wait {
        payload.insert("start_url_wait".into(), json!(wait));
    }
    if let Some(labels) = &request.labels {
        payload.insert("labels".into(), json!(labels));
    }
    if request.vnc {
        payload.insert("vnc".into(), json!(true));
    }
    if let Some(proxy) = &request.proxy {
        payload.insert("proxy".into(), json!(proxy));
    }

    let data = state
        .runner
        .create_session(&serde_json::Value::Object(payload))
        .await?;
    let detail = to_worker_detail(&state.worker_id, data);
    Ok((StatusCode::CREATED, Json(detail)).into_response())
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let data = state.runner.get_session(&session_id).await?;
    Ok(Json(to_worker_detail(&state.worker_id, data)).into_response())
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let data = state.runner.delete_session(&session_id).await?;
    Ok(Json(SessionDeleteResponse {
        id: data.id,
        status: data.status,
    })
    .into_response())
}

async fn touch_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let data = state.runner.touch_session(&session_id).await?;
    Ok(Json(to_worker_detail(&state.worker_id, data)).into_response())
}

/// Proxy WebSocket traffic between the caller and the underlying runner
/// session.
async fn session_websocket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| bridge_session(state, session_id, socket))
}

async fn bridge_session(state: Arc<AppState>, session_id: String, mut socket: WebSocket) {
    let upstream_endpoint = match state.runner.get_session(&session_id).await {
        Ok(data) if !data.ws_endpoint.is_empty() => data.ws_endpoint,
        _ => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "session_not_found".into(),
                })))
                .await;
            return;
        }
    };

    let context = format!("worker bridge for session {session_id}");
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
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&state.registry.gather(), &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "encode failure").into_response();
    }
    ([("content-type", prometheus::TEXT_FORMAT)], buffer).into_response()
}
