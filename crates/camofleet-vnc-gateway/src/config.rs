//! Gateway configuration, loaded from `VNCGATEWAY_`-prefixed environment
//! variables.

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid gateway configuration: {0}")]
    Invalid(String),

    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),
}

/// Runtime settings for the gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub runner_host: String,
    pub runner_http_scheme: String,
    pub runner_path_prefix: String,
    pub min_port: u16,
    pub max_port: u16,
    pub request_timeout: f64,
    pub tcp_connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub tcp_idle_timeout_ms: u64,
    pub ws_ping_interval_ms: u64,
    pub max_concurrent_sessions: usize,
    pub shutdown_grace_ms: u64,
}

impl GatewaySettings {
    pub fn load() -> Result<Self, ConfigError> {
        let raw: RawSettings = envy::prefixed("VNCGATEWAY_").from_env()?;
        Self::from_raw(raw)
    }

    pub fn load_from<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let raw: RawSettings = envy::prefixed("VNCGATEWAY_").from_iter(vars)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        if raw.min_port > raw.max_port {
            return Err(ConfigError::Invalid(
                "min_port must be less than or equal to max_port".into(),
            ));
        }
        if !scheme_is_valid(&raw.runner_http_scheme) {
            return Err(ConfigError::Invalid(
                "runner_http_scheme is not a valid URL scheme".into(),
            ));
        }
        if raw.max_concurrent_sessions == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_sessions must be at least 1".into(),
            ));
        }
        Ok(Self {
            host: raw.host,
            port: raw.port,
            cors_origins: raw.cors_origins,
            runner_host: raw.runner_host,
            runner_http_scheme: raw.runner_http_scheme,
            runner_path_prefix: raw.runner_path_prefix,
            min_port: raw.min_port,
            max_port: raw.max_port,
            request_timeout: raw.request_timeout,
            tcp_connect_timeout_ms: raw.tcp_connect_timeout_ms,
            read_timeout_ms: raw.read_timeout_ms,
            write_timeout_ms: raw.write_timeout_ms,
            tcp_idle_timeout_ms: raw.tcp_idle_timeout_ms,
            ws_ping_interval_ms: raw.ws_ping_interval_ms,
            max_concurrent_sessions: raw.max_concurrent_sessions,
            shutdown_grace_ms: raw.shutdown_grace_ms,
        })
    }

    /// Runner path prefix formatted for URL joins.
    pub fn normalised_prefix(&self) -> String {
        let value = self.runner_path_prefix.trim();
        if value.is_empty() {
            return String::new();
        }
        let with_slash = if value.starts_with('/') {
            value.to_string()
        } else {
            format!("/{value}")
        };
        with_slash.trim_end_matches('/').to_string()
    }

    /// Validate a raw `target_port` value against the configured range.
    pub fn validate_port(&self, port: Option<&str>) -> Result<u16, String> {
        let Some(raw) = port else {
            return Err("target_port query parameter is required".into());
        };
        let value: u16 = raw
            .parse()
            .map_err(|_| "target_port must be an integer".to_string())?;
        if value < self.min_port || value > self.max_port {
            return Err("target_port outside of the allowed range".into());
        }
        Ok(value)
    }
}

fn scheme_is_valid(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_cors_origins")]
    cors_origins: Vec<String>,
    #[serde(default = "default_runner_host")]
    runner_host: String,
    #[serde(default = "default_runner_http_scheme")]
    runner_http_scheme: String,
    #[serde(default)]
    runner_path_prefix: String,
    #[serde(default = "default_min_port")]
    min_port: u16,
    #[serde(default = "default_max_port")]
    max_port: u16,
    #[serde(default = "default_request_timeout")]
    request_timeout: f64,
    #[serde(default = "default_tcp_connect_timeout")]
    tcp_connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout")]
    read_timeout_ms: u64,
    #[serde(default = "default_write_timeout")]
    write_timeout_ms: u64,
    #[serde(default = "default_idle_timeout")]
    tcp_idle_timeout_ms: u64,
    #[serde(default = "default_ping_interval")]
    ws_ping_interval_ms: u64,
    #[serde(default = "default_max_sessions")]
    max_concurrent_sessions: usize,
    #[serde(default = "default_shutdown_grace")]
    shutdown_grace_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    6080
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".into()]
}
fn default_runner_host() -> String {
    "runner-vnc".into()
}
fn default_runner_http_scheme() -> String {
    "http".into()
}
fn default_min_port() -> u16 {
    6900
}
fn default_max_port() -> u16 {
    6999
}
fn default_request_timeout() -> f64 {
    10.0
}
fn default_tcp_connect_timeout() -> u64 {
    5_000
}
fn default_read_timeout() -> u64 {
    120_000
}
fn default_write_timeout() -> u64 {
    120_000
}
fn default_idle_timeout() -> u64 {
    300_000
}
fn default_ping_interval() -> u64 {
    25_000
}
fn default_max_sessions() -> usize {
    1_000
}
fn default_shutdown_grace() -> u64 {
    30_000
}
