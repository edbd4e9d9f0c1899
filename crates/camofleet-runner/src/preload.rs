//! Optional start-URL preloading.
//!
//! After a session reaches READY the runner can open the configured start
//! URL so the first human or script attaching to the session does not pay
//! the navigation cost. The preloader connects to the browser server as a
//! regular automation client, opens a context and a page, navigates, and
//! keeps its connection alive so the page survives until session teardown.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::models::StartUrlWait;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type ControllerSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum PreloadError {
    #[error("browser server connection error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("browser server closed the connection")]
    Disconnected,
    #[error("timed out waiting for a command response")]
    Timeout,
    #[error("command {method} failed: {detail}")]
    Command { method: String, detail: String },
}

/// Automation-client connection driving the preloaded page.
///
/// Dropping the connection closes the remote context, so the controller is
/// retained inside the session until teardown.
#[derive(Debug)]
pub struct PreloadController {
    socket: Option<ControllerSocket>,
    context_id: Value,
    page_id: Value,
}

impl PreloadController {
    /// Best-effort close of the remote page, context and the socket itself.
    pub async fn close(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        let close_page = command(4_000, "page.close", json!({ "page": self.page_id }));
        let close_context = command(4_001, "context.close", json!({ "context": self.context_id }));
        let _ = socket.send(Message::text(close_page.to_string())).await;
        let _ = socket.send(Message::text(close_context.to_string())).await;
        let _ = socket.close(None).await;
    }
}

/// Connect to `ws_endpoint` and navigate a fresh page to `start_url`.
pub async fn preload_start_url(
    ws_endpoint: &str,
    start_url: &str,
    wait: StartUrlWait,
) -> Result<PreloadController, PreloadError> {
    let (mut socket, _) = connect_async(ws_endpoint).await?;

    let context_id = roundtrip(&mut socket, 1, "context.new", json!({})).await?;
    let page_id = roundtrip(
        &mut socket,
        2,
        "page.new",
        json!({ "context": context_id }),
    )
    .await?;
    let wait_until = match wait {
        StartUrlWait::Domcontentloaded => "domcontentloaded",
        _ => "load",
    };
    roundtrip(
        &mut socket,
        3,
        "page.goto",
        json!({ "page": page_id, "url": start_url, "waitUntil": wait_until }),
    )
    .await?;

    debug!(url = start_url, "start URL preloaded");
    Ok(PreloadController {
        socket: Some(socket),
        context_id,
        page_id,
    })
}

fn command(id: u64, method: &str, params: Value) -> Value {
    json!({ "id": id, "method": method, "params": params })
}

/// Send one command frame and wait for the response carrying the same id.
async fn roundtrip(
    socket: &mut ControllerSocket,
    id: u64,
    method: &str,
    params: Value,
) -> Result<Value, PreloadError> {
    socket
        .send(Message::text(command(id, method, params).to_string()))
        .await?;

    let deadline = tokio::time::Instant::now() + COMMAND_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = timeout(remaining, socket.next())
            .await
            .map_err(|_| PreloadError::Timeout)?
            .ok_or(PreloadError::Disconnected)??;

        let Message::Text(text) = frame else {
            continue;
        };
        let Ok(payload) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        if payload.get("id").and_then(Value::as_u64) != Some(id) {
            // Unsolicited event frames are interleaved with responses.
            continue;
        }
        if let Some(error) = payload.get("error") {
            return Err(PreloadError::Command {
                method: method.to_string(),
                detail: error.to_string(),
            });
        }
        return Ok(payload.get("result").cloned().unwrap_or(Value::Null));
    }
}
