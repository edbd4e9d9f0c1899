//! Axum application exposing the runner session API.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;

use camofleet_shared::cors_layer;

use crate::config::RunnerSettings;
use crate::diagnostics::run_network_diagnostics;
use crate::error::RunnerError;
use crate::models::{HealthResponse, SessionCreateRequest};
use crate::sessions::SessionManager;

/// State shared between request handlers.
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub registry: Registry,
    diagnostics: std::sync::Mutex<serde_json::Value>,
    diagnostics_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AppState {
    pub fn new(settings: &RunnerSettings, manager: Arc<SessionManager>) -> Arc<Self> {
        let initial_status = if settings.network_diagnostics.is_empty() {
            "disabled"
        } else {
            "pending"
        };
        Arc::new(Self {
            manager,
            registry: Registry::new(),
            diagnostics: std::sync::Mutex::new(json!({
                "status": initial_status,
                "results": serde_json::Value::Null,
            })),
            diagnostics_task: std::sync::Mutex::new(None),
        })
    }

    /// Kick off the start-up network probes in the background.
    pub fn start_diagnostics(self: &Arc<Self>, settings: &RunnerSettings) {
        if settings.network_diagnostics.is_empty() {
            return;
        }
        let state = Arc::clone(self);
        let targets = settings.network_diagnostics.clone();
        let timeout = std::time::Duration::from_secs_f64(settings.diagnostics_timeout_seconds);
        let task = tokio::spawn(async move {
            let results = run_network_diagnostics(&targets, timeout).await;
            let payload = json!({
                "status": "complete",
                "results": results,
            });
            *state.diagnostics.lock().unwrap_or_else(|e| e.into_inner()) = payload;
        });
        *self
            .diagnostics_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Cancel the probe task if it is still running.
    pub fn stop_diagnostics(&self) {
        if let Some(task) = self
            .diagnostics_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    fn diagnostics_payload(&self) -> serde_json::Value {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// API error carrying the status code and a `{"detail": …}` body.
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn not_found(detail: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.to_string(),
        }
    }

    pub fn unprocessable(detail: &str) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            detail: detail.to_string(),
        }
    }
}

/// Reject payload values outside the documented bounds.
fn validate_create_request(request: &SessionCreateRequest) -> Result<(), ApiError> {
    if let Some(ttl) = request.idle_ttl_seconds {
        if !(30..=3600).contains(&ttl) {
            return Err(ApiError::unprocessable(
                "idle_ttl_seconds must be within [30, 3600]",
            ));
        }
    }
    if let Some(url) = &request.start_url {
        if url.len() > 1024 {
            return Err(ApiError::unprocessable(
                "start_url must be at most 1024 characters",
            ));
        }
    }
    Ok(())
}

impl From<RunnerError> for ApiError {
    fn from(err: RunnerError) -> Self {
        let status = match &err {
            RunnerError::VncUnavailable
            | RunnerError::NoCapacity
            | RunnerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

/// Build the runner router.
pub fn create_app(settings: &RunnerSettings, state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/:session_id",
            get(get_session).delete(delete_session),
        )
        .route("/sessions/:session_id/touch", post(touch_session))
        .route(&settings.metrics_endpoint, get(metrics))
        .layer(cors_layer(&settings.cors_origins))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let vnc = if state.manager.vnc_available() {
        "ok"
    } else {
        "unavailable"
    };
    Json(HealthResponse {
        status: "ok".into(),
        version: camofleet_shared::VERSION.into(),
        checks: HashMap::from([("vnc".to_string(), vnc.to_string())]),
        diagnostics: Some(state.diagnostics_payload()),
    })
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Response {
    Json(state.manager.list_details().await).into_response()
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SessionCreateRequest>,
) -> Result<Response, ApiError> {
    validate_create_request(&request)?;
    let detail = state.manager.create(request).await?;
    Ok((StatusCode::CREATED, Json(detail)).into_response())
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.manager.get_detail(&session_id).await {
        Some(detail) => Ok(Json(detail).into_response()),
        None => Err(ApiError::not_found("Session not found")),
    }
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.manager.delete(&session_id).await {
        Some(response) => Ok(Json(response).into_response()),
        None => Err(ApiError::not_found("Session not found")),
    }
}

async fn touch_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.manager.touch(&session_id).await {
        Some(detail) => Ok(Json(detail).into_response()),
        None => Err(ApiError::not_found("Session not found")),
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&state.registry.gather(), &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "encode failure").into_response();
    }
    (
        [("content-type", prometheus::TEXT_FORMAT)],
        buffer,
    )
        .into_response()
}
