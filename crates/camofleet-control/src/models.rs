//! Wire models for the public control-plane API.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Health information for one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub name: String,
    pub healthy: bool,
    pub detail: serde_json::Value,
    pub supports_vnc: bool,
}

/// Session descriptor merged from a worker response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub worker: String,
    pub id: String,
    pub status: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
    pub browser: String,
    pub headless: bool,
    pub idle_ttl_seconds: u64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub ws_endpoint: String,
    #[serde(default)]
    pub vnc_enabled: Option<bool>,
    #[serde(default)]
    pub vnc: serde_json::Value,
    #[serde(default)]
    pub start_url_wait: Option<String>,
}

/// Inbound payload for creating a session somewhere in the fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_url: Option<String>,
    #[serde(default)]
    pub vnc: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_url_wait: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<serde_json::Value>,
}
