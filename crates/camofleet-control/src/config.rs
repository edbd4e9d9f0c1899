//! Control-plane configuration, loaded from `CONTROL_`-prefixed environment
//! variables. The worker array is a JSON-encoded value.

use serde::Deserialize;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid control-plane configuration: {0}")]
    Invalid(String),

    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),
}

/// One worker entry as configured by the operator.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
pub struct WorkerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub vnc_ws: Option<String>,
    #[serde(default)]
    pub vnc_http: Option<String>,
    #[serde(default)]
    pub supports_vnc: bool,
}

/// Runtime settings for the control plane.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub workers: Vec<WorkerConfig>,
    pub request_timeout: f64,
    pub public_api_prefix: String,
    pub metrics_endpoint: String,
    pub list_sessions_concurrency: usize,
}

impl ControlSettings {
    pub fn load() -> Result<Self, ConfigError> {
        let raw: RawSettings = envy::prefixed("CONTROL_").from_env()?;
        Self::from_raw(raw)
    }

    pub fn load_from<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let raw: RawSettings = envy::prefixed("CONTROL_").from_iter(vars)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        let workers: Vec<WorkerConfig> = match raw.workers.as_deref() {
            None => default_workers(),
            Some(text) => serde_json::from_str(text)
                .map_err(|err| ConfigError::Invalid(format!("workers is not valid JSON: {err}")))?,
        };
        for worker in &workers {
            if worker.name.is_empty() {
                return Err(ConfigError::Invalid("worker name must not be empty".into()));
            }
            Url::parse(&worker.url).map_err(|err| {
                ConfigError::Invalid(format!("worker {} has a malformed URL: {err}", worker.name))
            })?;
        }
        if !(raw.request_timeout > 0.0) {
            return Err(ConfigError::Invalid(
                "request_timeout must be positive".into(),
            ));
        }
        if raw.list_sessions_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "list_sessions_concurrency must be at least 1".into(),
            ));
        }
        Ok(Self {
            host: raw.host,
            port: raw.port,
            cors_origins: raw.cors_origins,
            workers,
            request_timeout: raw.request_timeout,
            public_api_prefix: raw.public_api_prefix,
            metrics_endpoint: raw.metrics_endpoint,
            list_sessions_concurrency: raw.list_sessions_concurrency,
        })
    }
}

fn default_workers() -> Vec<WorkerConfig> {
    vec![WorkerConfig {
        name: "local".into(),
        url: "http://worker:8080".into(),
        vnc_ws: None,
        vnc_http: None,
        supports_vnc: false,
    }]
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_cors_origins")]
    cors_origins: Vec<String>,
    #[serde(default)]
    workers: Option<String>,
    #[serde(default = "default_request_timeout")]
    request_timeout: f64,
    #[serde(default = "default_public_api_prefix")]
    public_api_prefix: String,
    #[serde(default = "default_metrics_endpoint")]
    metrics_endpoint: String,
    #[serde(default = "default_list_concurrency")]
    list_sessions_concurrency: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    9000
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".into()]
}
fn default_request_timeout() -> f64 {
    10.0
}
fn default_public_api_prefix() -> String {
    "/".into()
}
fn default_metrics_endpoint() -> String {
    "/metrics".into()
}
fn default_list_concurrency() -> usize {
    5
}
