//! Wire models for the worker API and the runner responses it consumes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Browser identifier reported to clients; fixed for the whole fleet.
pub const BROWSER_NAME: &str = "camoufox";

/// Lifecycle states mirrored from the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Init,
    Ready,
    Terminating,
    Dead,
}

/// Per-session proxy override forwarded to the runner untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bypass: Option<String>,
}

/// Inbound payload for creating a new browser session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionCreateRequest {
    pub headless: Option<bool>,
    pub idle_ttl_seconds: Option<u64>,
    pub start_url: Option<String>,
    pub start_url_wait: Option<String>,
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub vnc: bool,
    pub proxy: Option<ProxyConfig>,
}

/// Session payload as reported by the runner.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSessionDetail {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub headless: bool,
    pub idle_ttl_seconds: u64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub vnc: bool,
    #[serde(default = "default_start_url_wait")]
    pub start_url_wait: String,
    pub ws_endpoint: String,
    #[serde(default)]
    pub vnc_info: serde_json::Value,
}

fn default_start_url_wait() -> String {
    "load".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerDeleteResponse {
    pub id: String,
    pub status: SessionStatus,
}

/// Session representation exposed by the worker API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub browser: String,
    pub headless: bool,
    pub idle_ttl_seconds: u64,
    pub labels: HashMap<String, String>,
    pub worker_id: String,
    pub vnc_enabled: bool,
    pub start_url_wait: String,
    pub ws_endpoint: String,
    pub vnc: serde_json::Value,
}

/// Response returned after scheduling a deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDeleteResponse {
    pub id: String,
    pub status: SessionStatus,
}

/// Simple health payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HashMap<String, String>,
    /// Runner network diagnostics, forwarded verbatim when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,
}

/// Re-project a runner payload into the worker schema.
pub fn to_worker_detail(worker_id: &str, data: RunnerSessionDetail) -> SessionDetail {
    let ws_endpoint = format!("/sessions/{}/ws", data.id);
    SessionDetail {
        id: data.id,
        status: data.status,
        created_at: data.created_at,
        last_seen_at: data.last_seen_at,
        browser: BROWSER_NAME.to_string(),
        headless: data.headless,
        idle_ttl_seconds: data.idle_ttl_seconds,
        labels: data.labels,
        worker_id: worker_id.to_string(),
        vnc_enabled: data.vnc,
        start_url_wait: data.start_url_wait,
        ws_endpoint,
        vnc: data.vnc_info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runner_detail() -> RunnerSessionDetail {
        serde_json::from_value(json!({
            "id": "sess-1",
            "status": "READY",
            "created_at": "2026-01-01T00:00:00Z",
            "last_seen_at": "2026-01-01T00:00:05Z",
            "headless": false,
            "idle_ttl_seconds": 300,
            "labels": {"team": "qa"},
            "vnc": true,
            "start_url_wait": "load",
            "ws_endpoint": "ws://127.0.0.1:45001/abc",
            "vnc_info": {"ws": "ws://127.0.0.1:6900/websockify", "http": null, "password_protected": false},
        }))
        .unwrap()
    }

    #[test]
    fn worker_detail_relabels_the_session() {
        let detail = to_worker_detail("worker-uuid", runner_detail());
        assert_eq!(detail.browser, "camoufox");
        assert_eq!(detail.worker_id, "worker-uuid");
        assert_eq!(detail.ws_endpoint, "/sessions/sess-1/ws");
        assert!(detail.vnc_enabled);
        assert_eq!(detail.vnc["ws"], "ws://127.0.0.1:6900/websockify");
        assert_eq!(detail.labels.get("team"), Some(&"qa".to_string()));
    }

    #[test]
    fn runner_detail_tolerates_missing_optional_fields() {
        let detail: RunnerSessionDetail = serde_json::from_value(json!({
            "id": "sess-2",
            "status": "READY",
            "created_at": "2026-01-01T00:00:00Z",
            "last_seen_at": "2026-01-01T00:00:00Z",
            "headless": true,
            "idle_ttl_seconds": 120,
            "ws_endpoint": "ws://127.0.0.1:45002/def",
        }))
        .unwrap();
        assert_eq!(detail.start_url_wait, "load");
        assert!(!detail.vnc);
        assert!(detail.labels.is_empty());
    }
}
