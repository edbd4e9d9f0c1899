//! Wire models exposed by the runner API.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states for a session.
///
/// `Init` and `Terminating` are transient: the session table only ever
/// exposes `Ready` entries, and `Dead` is reached after teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Init,
    Ready,
    Terminating,
    Dead,
}

/// Wait condition applied when preloading the start URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartUrlWait {
    None,
    Domcontentloaded,
    #[default]
    Load,
}

/// Per-session proxy override passed straight to the browser server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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
    pub start_url_wait: Option<StartUrlWait>,
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub vnc: bool,
    pub proxy: Option<ProxyConfig>,
}

/// Connection metadata for the optional VNC toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VncInfo {
    pub ws: Option<String>,
    pub http: Option<String>,
    pub password_protected: bool,
}

impl VncInfo {
    /// Payload reported for sessions without a VNC toolchain.
    pub fn disabled() -> Self {
        Self {
            ws: None,
            http: None,
            password_protected: false,
        }
    }
}

/// Short session description used by list responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub headless: bool,
    pub idle_ttl_seconds: u64,
    pub labels: HashMap<String, String>,
    pub vnc: bool,
    pub start_url_wait: StartUrlWait,
}

/// Summary plus connection endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub ws_endpoint: String,
    pub vnc_info: VncInfo,
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
    /// Network probe results gathered at start-up, if enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<serde_json::Value>,
}
