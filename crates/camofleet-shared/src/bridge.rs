//! Bidirectional WebSocket proxying between an accepted server socket and a
//! dialed upstream connection.
//!
//! The bridge runs one forwarder per direction and stops as soon as either
//! side finishes: a clean close from one peer closes the other quietly, the
//! first unexpected error wins and the client is closed with 1011.

use std::borrow::Cow;
use std::future::Future;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as UpstreamMessage;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Client connection to the upstream service, as produced by
/// [`tokio_tungstenite::connect_async`].
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Which peer ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClosedBy {
    Client,
    Upstream,
}

#[derive(Debug, thiserror::Error)]
enum BridgeError {
    #[error("client socket error: {0}")]
    Client(#[from] axum::Error),
    #[error("upstream socket error: {0}")]
    Upstream(#[from] tungstenite::Error),
}

/// Proxy frames between `server` (already accepted) and the upstream socket
/// produced by `connect_upstream` until either side terminates.
///
/// Text, binary, ping and pong frames arriving from the client are replayed
/// upstream verbatim; data frames from upstream are replayed to the client.
/// Pings originating upstream are answered by the WebSocket library itself,
/// so the bridge never synthesizes its own keepalives.
pub async fn bridge_websocket<F, Fut>(server: WebSocket, connect_upstream: F, log_context: &str)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<UpstreamSocket, tungstenite::Error>>,
{
    let mut server = server;
    let upstream = match connect_upstream().await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(context = log_context, error = %err, "failed to dial upstream websocket");
            let _ = server
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: Cow::from("upstream_unreachable"),
                })))
                .await;
            return;
        }
    };

    let (mut server_tx, mut server_rx) = server.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    // Whichever forwarder finishes first decides the outcome; dropping the
    // other future cancels it within one poll.
    let outcome = tokio::select! {
        result = client_to_upstream(&mut server_rx, &mut upstream_tx) => result,
        result = upstream_to_client(&mut upstream_rx, &mut server_tx) => result,
    };

    match outcome {
        Ok(closed_by) => {
            debug!(context = log_context, ?closed_by, "websocket bridge finished");
            let _ = server_tx.send(Message::Close(None)).await;
        }
        Err(err) => {
            warn!(context = log_context, error = %err, "websocket bridge failure");
            let _ = server_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: Cow::from("bridge_error"),
                })))
                .await;
        }
    }
    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
}

/// Relay frames arriving from the public client to the upstream socket.
async fn client_to_upstream(
    server_rx: &mut SplitStream<WebSocket>,
    upstream_tx: &mut SplitSink<UpstreamSocket, UpstreamMessage>,
) -> Result<ClosedBy, BridgeError> {
    while let Some(message) = server_rx.next().await {
        match message? {
            Message::Text(text) => {
                upstream_tx.send(UpstreamMessage::Text(text.into())).await?;
            }
            Message::Binary(data) => {
                upstream_tx
                    .send(UpstreamMessage::Binary(data.into()))
                    .await?;
            }
            Message::Ping(payload) => {
                upstream_tx
                    .send(UpstreamMessage::Ping(payload.into()))
                    .await?;
            }
            Message::Pong(payload) => {
                upstream_tx
                    .send(UpstreamMessage::Pong(payload.into()))
                    .await?;
            }
            Message::Close(_) => break,
        }
    }
    // Client went away; tell upstream and stop this direction.
    let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
    Ok(ClosedBy::Client)
}

/// Relay frames arriving from upstream back to the public client.
async fn upstream_to_client(
    upstream_rx: &mut SplitStream<UpstreamSocket>,
    server_tx: &mut SplitSink<WebSocket, Message>,
) -> Result<ClosedBy, BridgeError> {
    while let Some(message) = upstream_rx.next().await {
        match message? {
            UpstreamMessage::Text(text) => {
                server_tx.send(Message::Text(text.to_string())).await?;
            }
            UpstreamMessage::Binary(data) => {
                server_tx.send(Message::Binary(data.to_vec())).await?;
            }
            // The library queues pong replies for upstream pings on its own.
            UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) => {}
            UpstreamMessage::Close(_) => break,
            UpstreamMessage::Frame(_) => {}
        }
    }
    Ok(ClosedBy::Upstream)
}
