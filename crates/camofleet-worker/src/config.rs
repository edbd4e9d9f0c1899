//! Worker configuration, loaded from `WORKER_`-prefixed environment
//! variables.

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid worker configuration: {0}")]
    Invalid(String),

    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),
}

/// Default session parameters applied when clients omit optional fields.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub idle_ttl_seconds: u64,
    pub headless: bool,
}

/// Runtime settings for the worker service.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub metrics_endpoint: String,
    pub session_defaults: SessionDefaults,
    pub runner_base_url: String,
    pub supports_vnc: bool,
    pub request_timeout: f64,
}

impl WorkerSettings {
    pub fn load() -> Result<Self, ConfigError> {
        let raw: RawSettings = envy::prefixed("WORKER_").from_env()?;
        Self::from_raw(raw)
    }

    pub fn load_from<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let raw: RawSettings = envy::prefixed("WORKER_").from_iter(vars)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        if raw.default_idle_ttl_seconds < 30 || raw.default_idle_ttl_seconds > 3600 {
            return Err(ConfigError::Invalid(
                "default_idle_ttl_seconds must be within [30, 3600]".into(),
            ));
        }
        if !(raw.request_timeout > 0.0) {
            return Err(ConfigError::Invalid(
                "request_timeout must be positive".into(),
            ));
        }
        Ok(Self {
            host: raw.host,
            port: raw.port,
            cors_origins: raw.cors_origins,
            metrics_endpoint: raw.metrics_endpoint,
            session_defaults: SessionDefaults {
                idle_ttl_seconds: raw.default_idle_ttl_seconds,
                headless: raw.default_headless,
            },
            runner_base_url: raw.runner_base_url.trim_end_matches('/').to_string(),
            supports_vnc: raw.supports_vnc,
            request_timeout: raw.request_timeout,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_cors_origins")]
    cors_origins: Vec<String>,
    #[serde(default = "default_metrics_endpoint")]
    metrics_endpoint: String,
    #[serde(default = "default_idle_ttl")]
    default_idle_ttl_seconds: u64,
    #[serde(default)]
    default_headless: bool,
    #[serde(default = "default_runner_base_url")]
    runner_base_url: String,
    #[serde(default)]
    supports_vnc: bool,
    #[serde(default = "default_request_timeout")]
    request_timeout: f64,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".into()]
}
fn default_metrics_endpoint() -> String {
    "/metrics".into()
}
fn default_idle_ttl() -> u64 {
    300
}
fn default_runner_base_url() -> String {
    "http://127.0.0.1:8070".into()
}
fn default_request_timeout() -> f64 {
    30.0
}
