//! Axum application for the VNC gateway: HTTP asset proxying plus the
//! WebSocket↔TCP RFB proxy.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{OriginalUri, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use camofleet_shared::cors_layer;

use crate::config::GatewaySettings;
use crate::gate::{GateRejection, SessionGate};
use crate::target::{parse_cookie_header, select_target_port, PortSource, TARGET_PORT_COOKIE};

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const TCP_READ_CHUNK: usize = 32 * 1024;

/// Objects shared across request handlers.
pub struct AppState {
    pub settings: GatewaySettings,
    pub client: reqwest::Client,
    pub gate: Arc<SessionGate>,
}

impl AppState {
    pub fn new(settings: GatewaySettings) -> Result<Arc<Self>, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(settings.request_timeout))
            .build()?;
        Ok(Arc::new(Self {
            gate: Arc::new(SessionGate::new(settings.max_concurrent_sessions)),
            settings,
            client,
        }))
    }
}

/// Build the gateway router.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(ready))
        .route("/vnc", get(proxy_http).options(proxy_http))
        .route("/vnc/websockify", get(proxy_websocket))
        .route("/vnc/*path", get(proxy_http).options(proxy_http))
        .layer(cors_layer(&state.settings.cors_origins))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn ready(State(state): State<Arc<AppState>>) -> Response {
    if state.gate.is_closing() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "draining"})),
        )
            .into_response();
    }
    Json(json!({"status": "ok"})).into_response()
}

// ── HTTP proxying ───────────────────────────────────────────────────────

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Query string with `target_port` removed.
fn forwarded_query(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key != "target_port")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn build_upstream_url(
    settings: &GatewaySettings,
    port: u16,
    path_suffix: &str,
    query: &str,
) -> String {
    let prefix = settings.normalised_prefix();
    let suffix = if path_suffix.is_empty() {
        "/"
    } else {
        path_suffix
    };
    let mut combined = format!("{prefix}{suffix}");
    if !combined.starts_with('/') {
        combined = format!("/{combined}");
    }
    let query_part = if query.is_empty() {
        String::new()
    } else {
        format!("?{query}")
    };
    format!(
        "{}://{}:{}{}{}",
        settings.runner_http_scheme, settings.runner_host, port, combined, query_part
    )
}

fn resolve_port(
    state: &AppState,
    query: Option<&str>,
    headers: &HeaderMap,
) -> Result<(u16, PortSource), String> {
    let query_value = query_param(query, "target_port");
    let referer = headers
        .get("referer")
        .and_then(|value| value.to_str().ok());
    let cookies = parse_cookie_header(
        headers
            .get("cookie")
            .and_then(|value| value.to_str().ok()),
    );
    let selected = select_target_port(query_value.as_deref(), referer, &cookies);
    let (raw, source) = match selected {
        Some((raw, source)) => (Some(raw), Some(source)),
        None => (None, None),
    };
    let port = state.settings.validate_port(raw.as_deref())?;
    Ok((port, source.unwrap_or(PortSource::Query)))
}

async fn proxy_http(
    State(state): State<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path_suffix = match uri.path().strip_prefix("/vnc") {
        Some("") => "/".to_string(),
        Some(rest) => rest.to_string(),
        None => "/".to_string(),
    };

    let (port, source) = match resolve_port(&state, uri.query(), &headers) {
        Ok(resolved) => resolved,
        Err(detail) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail }))).into_response()
        }
    };

    let upstream_url = build_upstream_url(
        &state.settings,
        port,
        &path_suffix,
        &forwarded_query(uri.query()),
    );

    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    let mut request = state.client.request(reqwest_method, &upstream_url);
    for (name, value) in &headers {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || lower == "host" {
            continue;
        }
        request = request.header(name.as_str(), value.as_bytes());
    }
    if !body.is_empty() {
        request = request.body(body.to_vec());
    }

    let upstream_response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"detail": err.to_string()})),
            )
                .into_response()
        }
    };

    let status =
        StatusCode::from_u16(upstream_response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name.as_str()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.insert(name, value);
        }
    }

    let payload = match upstream_response.bytes().await {
        Ok(payload) => payload,
        Err(err) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"detail": err.to_string()})),
            )
                .into_response()
        }
    };

    // Sticky target-port cookie lets follow-up asset requests omit the
    // query parameter.
    if source == PortSource::Query {
        if let Ok(cookie) = HeaderValue::from_str(&format!(
            "{TARGET_PORT_COOKIE}={port}; Path=/vnc; SameSite=Lax"
        )) {
            response_headers.append("set-cookie", cookie);
        }
    }

    (status, response_headers, payload).into_response()
}

// ── WebSocket proxying ──────────────────────────────────────────────────

enum SessionEnd {
    ClientClosed,
}

enum SessionFailure {
    IdleTimeout,
    UpstreamClosed,
    UpstreamIo(std::io::Error),
    ClientSocket(axum::Error),
    ShutdownForced,
}

async fn proxy_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    let resolved = resolve_port(&state, uri.query(), &headers);

    // Pick the first subprotocol the client offered.
    let offered: Vec<String> = headers
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let ws = if offered.is_empty() {
        ws
    } else {
        ws.protocols([offered[0].clone()])
    };

    ws.on_upgrade(move |socket| async move {
        match resolved {
            Ok((port, _)) => proxy_session_entry(state, port, socket).await,
            Err(detail) => {
                let reason = if detail.contains("required") {
                    "missing_id"
                } else {
                    "invalid_target_port"
                };
                close_socket(socket, 1008, reason).await;
            }
        }
    })
}

async fn close_socket(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Admission, TCP dial, proxy run and the final close frame.
async fn proxy_session_entry(state: Arc<AppState>, port: u16, socket: WebSocket) {
    if let Err(rejection) = state.gate.acquire() {
        let reason = match rejection {
            GateRejection::ShuttingDown => "shutting_down",
            GateRejection::CapacityExceeded => "session_limit",
        };
        close_socket(socket, 1013, reason).await;
        return;
    }
    let _slot = GateSlot(Arc::clone(&state.gate));

    let settings = &state.settings;
    let connect_timeout = Duration::from_millis(settings.tcp_connect_timeout_ms);
    let address = (settings.runner_host.as_str(), port);
    let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(port, error = %err, "upstream TCP connect failed");
            close_socket(socket, 1011, "upstream_unreachable").await;
            return;
        }
        Err(_) => {
            warn!(port, "upstream TCP connect timed out");
            close_socket(socket, 1011, "upstream_unreachable").await;
            return;
        }
    };
    stream.set_nodelay(true).ok();

    info!(port, "proxying VNC session");
    let closing = state.gate.closing_signal();
    let outcome = run_proxy_session(socket, stream, settings, closing).await;
    match outcome {
        Ok(SessionEnd::ClientClosed) => debug!(port, "client closed VNC session"),
        Err(SessionFailure::IdleTimeout) => debug!(port, "VNC session idle timeout"),
        Err(SessionFailure::UpstreamClosed) => debug!(port, "upstream closed VNC session"),
        Err(SessionFailure::UpstreamIo(err)) => {
            warn!(port, error = %err, "upstream I/O error in VNC session")
        }
        Err(SessionFailure::ClientSocket(err)) => {
            debug!(port, error = %err, "client socket error in VNC session")
        }
        Err(SessionFailure::ShutdownForced) => debug!(port, "VNC session closed by shutdown"),
    }
}

struct GateSlot(Arc<SessionGate>);

impl Drop for GateSlot {
    fn drop(&mut self) {
        self.0.release();
    }
}

type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Timestamp of the last real data transfer, shared by the forwarders and
/// the idle watchdog. Keepalive pings and pongs never count as activity.
struct ActivityTracker {
    last: std::sync::Mutex<Instant>,
}

impl ActivityTracker {
    fn new() -> Self {
        Self {
            last: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

/// Run the forwarders, the pinger and the idle watchdog until the first of
/// them settles the session, then emit the matching close frame.
async fn run_proxy_session(
    socket: WebSocket,
    stream: TcpStream,
    settings: &GatewaySettings,
    closing: watch::Receiver<bool>,
) -> Result<SessionEnd, SessionFailure> {
    let read_timeout = Duration::from_millis(settings.read_timeout_ms);
    let write_timeout = Duration::from_millis(settings.write_timeout_ms);
    let idle_timeout = Duration::from_millis(settings.tcp_idle_timeout_ms);
    let ping_interval = Duration::from_millis(settings.ws_ping_interval_ms);
    let grace = Duration::from_millis(settings.shutdown_grace_ms);

    let (ws_sink, mut ws_rx) = socket.split();
    let ws_sink: SharedSink = Arc::new(Mutex::new(ws_sink));
    let (mut tcp_rx, mut tcp_tx) = stream.into_split();
    let activity = ActivityTracker::new();

    let outcome = tokio::select! {
        result = client_to_tcp(&mut ws_rx, &mut tcp_tx, &ws_sink, &activity, read_timeout, write_timeout) => result,
        result = tcp_to_client(&mut tcp_rx, &ws_sink, &activity, read_timeout, write_timeout) => result,
        result = pinger(&ws_sink, ping_interval) => result,
        result = idle_watchdog(&activity, idle_timeout, ping_interval.min(idle_timeout)) => result,
        result = forced_shutdown(closing, grace) => result,
    };

    let close_frame = match &outcome {
        Ok(SessionEnd::ClientClosed) => None,
        Err(SessionFailure::IdleTimeout) => Some((1011u16, "idle_timeout")),
        Err(SessionFailure::UpstreamClosed) => Some((1011, "upstream_closed")),
        Err(SessionFailure::UpstreamIo(_)) => Some((1011, "upstream_unreachable")),
        Err(SessionFailure::ClientSocket(_)) => None,
        Err(SessionFailure::ShutdownForced) => Some((1013, "shutting_down")),
    };
    if let Some((code, reason)) = close_frame {
        let mut sink = ws_sink.lock().await;
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }
    let _ = tcp_tx.shutdown().await;
    outcome
}

/// Client WS frames → upstream TCP bytes. Pings are answered in place.
async fn client_to_tcp(
    ws_rx: &mut SplitStream<WebSocket>,
    tcp_tx: &mut OwnedWriteHalf,
    ws_sink: &SharedSink,
    activity: &ActivityTracker,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<SessionEnd, SessionFailure> {
    loop {
        let message = match timeout(read_timeout, ws_rx.next()).await {
            Err(_) => return Err(SessionFailure::IdleTimeout),
            Ok(None) => return Ok(SessionEnd::ClientClosed),
            Ok(Some(Err(err))) => return Err(SessionFailure::ClientSocket(err)),
            Ok(Some(Ok(message))) => message,
        };

        let data = match message {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Ping(payload) => {
                let mut sink = ws_sink.lock().await;
                let _ = sink.send(Message::Pong(payload)).await;
                continue;
            }
            Message::Pong(_) => continue,
            Message::Close(_) => return Ok(SessionEnd::ClientClosed),
        };

        match timeout(write_timeout, tcp_tx.write_all(&data)).await {
            Err(_) => return Err(SessionFailure::IdleTimeout),
            Ok(Err(err)) => return Err(SessionFailure::UpstreamIo(err)),
            Ok(Ok(())) => {}
        }
        activity.touch();
    }
}

/// Upstream TCP bytes → client WS binary frames, 32 KiB at a time.
async fn tcp_to_client(
    tcp_rx: &mut OwnedReadHalf,
    ws_sink: &SharedSink,
    activity: &ActivityTracker,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<SessionEnd, SessionFailure> {
    let mut buffer = vec![0u8; TCP_READ_CHUNK];
    loop {
        let read = match timeout(read_timeout, tcp_rx.read(&mut buffer)).await {
            Err(_) => return Err(SessionFailure::IdleTimeout),
            Ok(Err(err)) => return Err(SessionFailure::UpstreamIo(err)),
            Ok(Ok(read)) => read,
        };
        if read == 0 {
            return Err(SessionFailure::UpstreamClosed);
        }

        let send = async {
            let mut sink = ws_sink.lock().await;
            sink.send(Message::Binary(buffer[..read].to_vec())).await
        };
        match timeout(write_timeout, send).await {
            Err(_) => return Err(SessionFailure::IdleTimeout),
            Ok(Err(err)) => return Err(SessionFailure::ClientSocket(err)),
            Ok(Ok(())) => {}
        }
        activity.touch();
    }
}

/// Periodic keepalive pings. A failed send means the socket is going away;
/// the reader side reports it, so this task just parks.
async fn pinger(
    ws_sink: &SharedSink,
    interval: Duration,
) -> Result<SessionEnd, SessionFailure> {
    loop {
        tokio::time::sleep(interval).await;
        let result = {
            let mut sink = ws_sink.lock().await;
            sink.send(Message::Ping(Vec::new())).await
        };
        if result.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Fires once no forwarder has reported activity for the whole idle
/// window. Checks run on the ping cadence, so keepalive pings alone never
/// keep a dead session alive past `idle_timeout`.
async fn idle_watchdog(
    activity: &ActivityTracker,
    idle_timeout: Duration,
    check_interval: Duration,
) -> Result<SessionEnd, SessionFailure> {
    loop {
        tokio::time::sleep(check_interval).await;
        if activity.idle_for() >= idle_timeout {
            return Err(SessionFailure::IdleTimeout);
        }
    }
}

/// After shutdown begins, existing sessions get the grace period before
/// they are torn down.
async fn forced_shutdown(
    mut closing: watch::Receiver<bool>,
    grace: Duration,
) -> Result<SessionEnd, SessionFailure> {
    if closing.wait_for(|value| *value).await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(grace).await;
    Err(SessionFailure::ShutdownForced)
}
