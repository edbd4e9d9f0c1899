//! Gateway tests with real upstream sockets.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;
use tower::ServiceExt;

use camofleet_vnc_gateway::app::{create_app, AppState};
use camofleet_vnc_gateway::config::GatewaySettings;

/// Serve a trivial HTTP app standing in for websockify's web server and
/// return the port it listens on.
async fn spawn_http_upstream() -> u16 {
    let app = Router::new()
        .route("/", get(|| async { "viewer index" }))
        .route("/core/rfb.js", get(|| async { "console.log('rfb')" }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// TCP echo server standing in for an RFB endpoint.
async fn spawn_tcp_echo_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buffer = [0u8; 4096];
                loop {
                    match stream.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => {
                            if stream.write_all(&buffer[..read]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

fn gateway_state(upstream_port: u16) -> Arc<AppState> {
    let settings = GatewaySettings::load_from(vec![
        (
            "VNCGATEWAY_RUNNER_HOST".to_string(),
            "127.0.0.1".to_string(),
        ),
        ("VNCGATEWAY_MIN_PORT".to_string(), upstream_port.to_string()),
        ("VNCGATEWAY_MAX_PORT".to_string(), upstream_port.to_string()),
    ])
    .unwrap();
    AppState::new(settings).unwrap()
}

#[tokio::test]
async fn http_proxy_forwards_and_sets_sticky_cookie() {
    let port = spawn_http_upstream().await;
    let app = create_app(gateway_state(port));

    let response = app
        .oneshot(
            Request::get(format!("/vnc?target_port={port}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(
        cookie,
        format!("vnc-target-port={port}; Path=/vnc; SameSite=Lax")
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"viewer index");
}

#[tokio::test]
async fn http_proxy_resolves_port_from_cookie() {
    let port = spawn_http_upstream().await;
    let app = create_app(gateway_state(port));

    let response = app
        .oneshot(
            Request::get("/vnc/core/rfb.js")
                .header("cookie", format!("vnc-target-port={port}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // No new cookie when the port did not come from the query.
    assert!(response.headers().get("set-cookie").is_none());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"console.log('rfb')");
}

#[tokio::test]
async fn http_proxy_resolves_port_from_referer() {
    let port = spawn_http_upstream().await;
    let app = create_app(gateway_state(port));

    let response = app
        .oneshot(
            Request::get("/vnc/core/rfb.js")
                .header(
                    "referer",
                    format!("http://gateway/vnc/vnc.html?target_port={port}"),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_target_port_is_400() {
    let port = spawn_http_upstream().await;
    let app = create_app(gateway_state(port));

    let response = app
        .oneshot(Request::get("/vnc").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn out_of_range_target_port_is_400() {
    let port = spawn_http_upstream().await;
    let app = create_app(gateway_state(port));

    for bad_port in [port - 1, port + 1] {
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/vnc?target_port={bad_port}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn unreachable_upstream_is_502() {
    // Valid range, but nothing listens on the port.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
        // Listener dropped here, so the port is closed.
    };
    let app = create_app(gateway_state(dead_port));

    let response = app
        .oneshot(
            Request::get(format!("/vnc?target_port={dead_port}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

async fn serve_gateway(state: Arc<AppState>) -> String {
    let app = create_app(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("{addr}")
}

#[tokio::test]
async fn websocket_proxies_binary_frames_to_tcp() {
    let port = spawn_tcp_echo_upstream().await;
    let addr = serve_gateway(gateway_state(port)).await;

    let (mut client, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/vnc/websockify?target_port={port}"
    ))
    .await
    .unwrap();

    client
        .send(Message::binary(vec![82u8, 70, 66, 32]))
        .await
        .unwrap();
    let echoed = loop {
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => break data,
            _ => continue,
        }
    };
    assert_eq!(&echoed[..], &[82u8, 70, 66, 32]);

    client.close(None).await.unwrap();
}

#[tokio::test]
async fn websocket_without_target_port_closes_1008() {
    let port = spawn_tcp_echo_upstream().await;
    let addr = serve_gateway(gateway_state(port)).await;

    let (mut client, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/vnc/websockify"))
            .await
            .unwrap();
    let mut saw_close = false;
    while let Some(Ok(message)) = client.next().await {
        if let Message::Close(frame) = message {
            let frame = frame.expect("close frame with code");
            assert_eq!(u16::from(frame.code), 1008);
            assert_eq!(frame.reason.as_str(), "missing_id");
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);
}

#[tokio::test]
async fn websocket_with_out_of_range_port_closes_1008() {
    let port = spawn_tcp_echo_upstream().await;
    let addr = serve_gateway(gateway_state(port)).await;

    let (mut client, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/vnc/websockify?target_port={}",
        port + 1
    ))
    .await
    .unwrap();
    let mut saw_close = false;
    while let Some(Ok(message)) = client.next().await {
        if let Message::Close(frame) = message {
            assert_eq!(u16::from(frame.unwrap().code), 1008);
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);
}

#[tokio::test]
async fn websocket_upstream_eof_closes_1011() {
    // Upstream accepts, then immediately closes the TCP stream.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    let addr = serve_gateway(gateway_state(port)).await;

    let (mut client, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/vnc/websockify?target_port={port}"
    ))
    .await
    .unwrap();
    let mut saw_close = false;
    while let Some(Ok(message)) = client.next().await {
        if let Message::Close(frame) = message {
            let frame = frame.expect("close frame with code");
            assert_eq!(u16::from(frame.code), 1011);
            assert_eq!(frame.reason.as_str(), "upstream_closed");
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);
}

#[tokio::test]
async fn idle_timeout_waits_for_the_full_window_despite_pings() {
    use std::time::{Duration, Instant};

    let port = spawn_tcp_echo_upstream().await;
    let settings = GatewaySettings::load_from(vec![
        (
            "VNCGATEWAY_RUNNER_HOST".to_string(),
            "127.0.0.1".to_string(),
        ),
        ("VNCGATEWAY_MIN_PORT".to_string(), port.to_string()),
        ("VNCGATEWAY_MAX_PORT".to_string(), port.to_string()),
        ("VNCGATEWAY_WS_PING_INTERVAL_MS".to_string(), "200".to_string()),
        ("VNCGATEWAY_TCP_IDLE_TIMEOUT_MS".to_string(), "2000".to_string()),
    ])
    .unwrap();
    let addr = serve_gateway(AppState::new(settings).unwrap()).await;

    let (mut client, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/vnc/websockify?target_port={port}"
    ))
    .await
    .unwrap();

    // One real transfer, then go idle and only answer keepalives.
    client.send(Message::binary(vec![1u8])).await.unwrap();
    loop {
        if let Message::Binary(_) = client.next().await.unwrap().unwrap() {
            break;
        }
    }

    let idle_started = Instant::now();
    let mut pings = 0usize;
    let close_frame = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Ping(_))) => pings += 1,
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(_)) => {}
                Some(Err(_)) | None => panic!("stream ended without a close frame"),
            }
        }
    })
    .await
    .expect("idle close never arrived");

    let idle_for = idle_started.elapsed();
    let frame = close_frame.expect("close frame with code");
    assert_eq!(u16::from(frame.code), 1011);
    assert_eq!(frame.reason.as_str(), "idle_timeout");
    // Several ping intervals fit inside the idle window without tripping
    // the watchdog early.
    assert!(
        idle_for >= Duration::from_millis(2000),
        "idle close fired after only {idle_for:?}"
    );
    assert!(pings >= 3, "expected keepalive pings while idle, got {pings}");
}

#[tokio::test]
async fn session_limit_closes_1013() {
    let port = spawn_tcp_echo_upstream().await;
    let settings = GatewaySettings::load_from(vec![
        (
            "VNCGATEWAY_RUNNER_HOST".to_string(),
            "127.0.0.1".to_string(),
        ),
        ("VNCGATEWAY_MIN_PORT".to_string(), port.to_string()),
        ("VNCGATEWAY_MAX_PORT".to_string(), port.to_string()),
        ("VNCGATEWAY_MAX_CONCURRENT_SESSIONS".to_string(), "1".to_string()),
    ])
    .unwrap();
    let addr = serve_gateway(AppState::new(settings).unwrap()).await;

    let (mut first, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/vnc/websockify?target_port={port}"
    ))
    .await
    .unwrap();
    // Prove the first session is live before opening the second.
    first.send(Message::binary(vec![1u8])).await.unwrap();
    loop {
        if let Message::Binary(_) = first.next().await.unwrap().unwrap() {
            break;
        }
    }

    let (mut second, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/vnc/websockify?target_port={port}"
    ))
    .await
    .unwrap();
    let mut saw_close = false;
    while let Some(Ok(message)) = second.next().await {
        if let Message::Close(frame) = message {
            let frame = frame.expect("close frame with code");
            assert_eq!(u16::from(frame.code), 1013);
            assert_eq!(frame.reason.as_str(), "session_limit");
            saw_close = true;
            break;
        }
    }
    assert!(saw_close);

    first.close(None).await.unwrap();
}

#[tokio::test]
async fn health_and_readiness_endpoints() {
    let port = spawn_http_upstream().await;
    let state = gateway_state(port);
    let app = create_app(state.clone());

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state
        .gate
        .begin_shutdown(std::time::Duration::from_millis(1))
        .await;
    let response = app
        .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
