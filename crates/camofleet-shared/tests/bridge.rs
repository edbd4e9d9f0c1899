//! End-to-end exercise of the WebSocket bridge with real sockets.

use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, connect_async};

use camofleet_shared::bridge_websocket;

/// Start a WebSocket echo server and return its `ws://` URL.
async fn spawn_echo_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut socket = accept_async(stream).await.unwrap();
                while let Some(Ok(message)) = socket.next().await {
                    match message {
                        Message::Text(_) | Message::Binary(_) => {
                            if socket.send(message).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });
    format!("ws://{addr}")
}

/// Start an axum app whose `/ws` route bridges to `upstream_url`.
async fn spawn_bridge_app(upstream_url: String) -> String {
    async fn ws_handler(ws: WebSocketUpgrade, State(upstream): State<String>) -> Response {
        ws.on_upgrade(move |socket| async move {
            bridge_websocket(
                socket,
                || async move { connect_async(upstream.as_str()).await.map(|(ws, _)| ws) },
                "bridge-test",
            )
            .await;
        })
    }

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(upstream_url);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}/ws")
}

#[tokio::test]
async fn frames_round_trip_in_order() {
    let upstream = spawn_echo_upstream().await;
    let bridge_url = spawn_bridge_app(upstream).await;

    let (mut client, _) = connect_async(bridge_url.as_str()).await.unwrap();

    client.send(Message::text("hello")).await.unwrap();
    client
        .send(Message::binary(vec![1u8, 2, 3, 4]))
        .await
        .unwrap();
    client.send(Message::text("world")).await.unwrap();

    let mut received = Vec::new();
    while received.len() < 3 {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => received.push(format!("text:{text}")),
            Message::Binary(data) => received.push(format!("binary:{data:?}")),
            _ => {}
        }
    }
    assert_eq!(
        received,
        vec![
            "text:hello".to_string(),
            "binary:b\"\\x01\\x02\\x03\\x04\"".to_string(),
            "text:world".to_string(),
        ]
    );
}

#[tokio::test]
async fn client_close_terminates_bridge() {
    let upstream = spawn_echo_upstream().await;
    let bridge_url = spawn_bridge_app(upstream).await;

    let (mut client, _) = connect_async(bridge_url.as_str()).await.unwrap();
    client.send(Message::text("ping-me")).await.unwrap();
    // Wait for the echo so the session is fully established before closing.
    loop {
        if let Message::Text(text) = client.next().await.unwrap().unwrap() {
            assert_eq!(text.as_str(), "ping-me");
            break;
        }
    }

    client.close(None).await.unwrap();
    // The bridge should let the stream end instead of hanging.
    while let Some(message) = client.next().await {
        if message.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn unreachable_upstream_closes_with_error() {
    // Nothing listens on this port.
    let bridge_url = spawn_bridge_app("ws://127.0.0.1:9".to_string()).await;

    let (mut client, _) = connect_async(bridge_url.as_str()).await.unwrap();
    let mut saw_close = false;
    while let Some(Ok(message)) = client.next().await {
        if let Message::Close(frame) = message {
            let frame = frame.expect("close frame with code");
            assert_eq!(u16::from(frame.code), 1011);
            saw_close = true;
            break;
        }
    }
    assert!(saw_close, "expected an error close frame from the bridge");
}
