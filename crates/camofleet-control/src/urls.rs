//! URL helpers for public endpoints and worker WebSocket addresses.

use url::Url;

/// Ensure the configured prefix is safe to concatenate with paths.
pub fn normalise_public_prefix(prefix: &str) -> String {
    let value = prefix.trim();
    if value.is_empty() || value == "/" {
        return String::new();
    }
    let with_slash = if value.starts_with('/') {
        value.to_string()
    } else {
        format!("/{value}")
    };
    with_slash.trim_end_matches('/').to_string()
}

/// Public WebSocket path exposed by the control plane for a session.
pub fn build_public_ws_endpoint(prefix: &str, worker_name: &str, session_id: &str) -> String {
    format!(
        "{}/sessions/{}/{}/ws",
        normalise_public_prefix(prefix),
        worker_name,
        session_id
    )
}

/// Translate the worker HTTP base URL into its session WebSocket URL.
pub fn build_worker_ws_endpoint(worker_url: &str, session_id: &str) -> Option<String> {
    let parsed = Url::parse(worker_url).ok()?;
    let scheme = if parsed.scheme() == "https" { "wss" } else { "ws" };
    let host = parsed.host_str()?;
    let port = parsed
        .port()
        .map(|port| format!(":{port}"))
        .unwrap_or_default();
    let base_path = parsed.path().trim_end_matches('/');
    Some(format!(
        "{scheme}://{host}{port}{base_path}/sessions/{session_id}/ws"
    ))
}
