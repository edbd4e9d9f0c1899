//! Runner configuration, loaded from `RUNNER_`-prefixed environment variables.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::{ProxyConfig, StartUrlWait};

/// Default session parameters applied when clients omit optional fields.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub idle_ttl_seconds: u64,
    pub headless: bool,
    pub start_url: Option<String>,
}

/// Launch profile for the browser-server subprocess.
///
/// The JSON config handed to the driver binary is assembled from these
/// values plus per-session overrides (display, proxy).
#[derive(Debug, Clone, Default)]
pub struct LaunchProfile {
    pub executable_path: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub firefox_prefs: Option<serde_json::Value>,
    pub ignore_default_args: Option<Vec<String>>,
    pub proxy: Option<ProxyConfig>,
}

/// Validated runtime settings for the runner.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub metrics_endpoint: String,
    pub cleanup_interval: u64,
    pub session_defaults: SessionDefaults,
    pub start_url_wait: StartUrlWait,

    pub prewarm_headless: usize,
    pub prewarm_vnc: usize,
    pub prewarm_check_interval_seconds: u64,

    pub vnc_ws_base: Option<String>,
    pub vnc_http_base: Option<String>,
    pub vnc_display_min: u32,
    pub vnc_display_max: u32,
    pub vnc_port_min: u16,
    pub vnc_port_max: u16,
    pub vnc_ws_port_min: u16,
    pub vnc_ws_port_max: u16,
    pub vnc_resolution: String,
    pub vnc_web_assets_path: Option<String>,
    pub vnc_startup_timeout_seconds: f64,

    pub driver_node_path: String,
    pub driver_cli_path: String,
    pub browser_name: String,
    pub browser_launch_timeout_seconds: u64,
    pub launch_profile: LaunchProfile,

    pub network_diagnostics: Vec<String>,
    pub diagnostics_timeout_seconds: f64,
}

impl RunnerSettings {
    /// Load and validate settings from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let raw: RawSettings = envy::prefixed("RUNNER_").from_env()?;
        Self::from_raw(raw)
    }

    /// Load from an explicit key/value iterator (used by tests).
    pub fn load_from<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let raw: RawSettings = envy::prefixed("RUNNER_").from_iter(vars)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        if raw.default_idle_ttl_seconds < 30 || raw.default_idle_ttl_seconds > 3600 {
            return Err(ConfigError::Invalid(
                "default_idle_ttl_seconds must be within [30, 3600]".into(),
            ));
        }
        if raw.cleanup_interval == 0 || raw.cleanup_interval > 3600 {
            return Err(ConfigError::Invalid(
                "cleanup_interval must be within (0, 3600]".into(),
            ));
        }
        if raw.vnc_display_min > raw.vnc_display_max {
            return Err(ConfigError::Invalid(
                "vnc_display_min must be less than or equal to vnc_display_max".into(),
            ));
        }
        if raw.vnc_port_min > raw.vnc_port_max {
            return Err(ConfigError::Invalid(
                "vnc_port_min must be less than or equal to vnc_port_max".into(),
            ));
        }
        if raw.vnc_ws_port_min > raw.vnc_ws_port_max {
            return Err(ConfigError::Invalid(
                "vnc_ws_port_min must be less than or equal to vnc_ws_port_max".into(),
            ));
        }
        if !(raw.vnc_startup_timeout_seconds > 0.0 && raw.vnc_startup_timeout_seconds <= 30.0) {
            return Err(ConfigError::Invalid(
                "vnc_startup_timeout_seconds must be within (0, 30]".into(),
            ));
        }
        if !(raw.diagnostics_timeout_seconds > 0.0 && raw.diagnostics_timeout_seconds <= 60.0) {
            return Err(ConfigError::Invalid(
                "diagnostics_timeout_seconds must be within (0, 60]".into(),
            ));
        }

        let firefox_prefs = parse_json_field("firefox_prefs", raw.firefox_prefs.as_deref())?;
        let browser_env: Option<HashMap<String, String>> =
            parse_json_field("browser_env", raw.browser_env.as_deref())?;
        let ignore_default_args: Option<Vec<String>> =
            parse_json_field("ignore_default_args", raw.ignore_default_args.as_deref())?;
        let default_proxy: Option<ProxyConfig> =
            parse_json_field("default_proxy", raw.default_proxy.as_deref())?;

        Ok(Self {
            host: raw.host,
            port: raw.port,
            cors_origins: raw.cors_origins,
            metrics_endpoint: raw.metrics_endpoint,
            cleanup_interval: raw.cleanup_interval,
            session_defaults: SessionDefaults {
                idle_ttl_seconds: raw.default_idle_ttl_seconds,
                headless: raw.default_headless,
                start_url: raw.default_start_url,
            },
            start_url_wait: raw.start_url_wait,
            prewarm_headless: raw.prewarm_headless,
            prewarm_vnc: raw.prewarm_vnc,
            prewarm_check_interval_seconds: raw.prewarm_check_interval_seconds,
            vnc_ws_base: raw.vnc_ws_base,
            vnc_http_base: raw.vnc_http_base,
            vnc_display_min: raw.vnc_display_min,
            vnc_display_max: raw.vnc_display_max,
            vnc_port_min: raw.vnc_port_min,
            vnc_port_max: raw.vnc_port_max,
            vnc_ws_port_min: raw.vnc_ws_port_min,
            vnc_ws_port_max: raw.vnc_ws_port_max,
            vnc_resolution: raw.vnc_resolution,
            vnc_web_assets_path: raw.vnc_web_assets_path,
            vnc_startup_timeout_seconds: raw.vnc_startup_timeout_seconds,
            driver_node_path: raw.driver_node_path,
            driver_cli_path: raw.driver_cli_path,
            browser_name: raw.browser_name,
            browser_launch_timeout_seconds: raw.browser_launch_timeout_seconds,
            launch_profile: LaunchProfile {
                executable_path: raw.browser_executable_path,
                args: raw.browser_args,
                env: browser_env.unwrap_or_default(),
                firefox_prefs,
                ignore_default_args,
                proxy: default_proxy,
            },
            network_diagnostics: raw.network_diagnostics,
            diagnostics_timeout_seconds: raw.diagnostics_timeout_seconds,
        })
    }

    /// Number of VNC sessions the configured ranges can serve at once.
    pub fn vnc_capacity(&self) -> usize {
        let display_span = (self.vnc_display_max - self.vnc_display_min + 1) as usize;
        let port_span = (self.vnc_port_max - self.vnc_port_min + 1) as usize;
        let ws_span = (self.vnc_ws_port_max - self.vnc_ws_port_min + 1) as usize;
        display_span.min(port_span).min(ws_span)
    }
}

fn parse_json_field<T: serde::de::DeserializeOwned>(
    name: &str,
    raw: Option<&str>,
) -> Result<Option<T>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(text) => serde_json::from_str(text)
            .map(Some)
            .map_err(|err| ConfigError::Invalid(format!("{name} is not valid JSON: {err}"))),
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
    #[serde(default = "default_cleanup_interval")]
    cleanup_interval: u64,

    #[serde(default = "default_idle_ttl")]
    default_idle_ttl_seconds: u64,
    #[serde(default)]
    default_headless: bool,
    #[serde(default)]
    default_start_url: Option<String>,
    #[serde(default)]
    start_url_wait: StartUrlWait,

    #[serde(default)]
    prewarm_headless: usize,
    #[serde(default)]
    prewarm_vnc: usize,
    #[serde(default = "default_prewarm_interval")]
    prewarm_check_interval_seconds: u64,

    #[serde(default)]
    vnc_ws_base: Option<String>,
    #[serde(default)]
    vnc_http_base: Option<String>,
    #[serde(default = "default_display_min")]
    vnc_display_min: u32,
    #[serde(default = "default_display_max")]
    vnc_display_max: u32,
    #[serde(default = "default_vnc_port_min")]
    vnc_port_min: u16,
    #[serde(default = "default_vnc_port_max")]
    vnc_port_max: u16,
    #[serde(default = "default_ws_port_min")]
    vnc_ws_port_min: u16,
    #[serde(default = "default_ws_port_max")]
    vnc_ws_port_max: u16,
    #[serde(default = "default_resolution")]
    vnc_resolution: String,
    #[serde(default = "default_web_assets_path")]
    vnc_web_assets_path: Option<String>,
    #[serde(default = "default_startup_timeout")]
    vnc_startup_timeout_seconds: f64,

    #[serde(default = "default_node_path")]
    driver_node_path: String,
    #[serde(default = "default_cli_path")]
    driver_cli_path: String,
    #[serde(default = "default_browser_name")]
    browser_name: String,
    #[serde(default = "default_launch_timeout")]
    browser_launch_timeout_seconds: u64,

    #[serde(default)]
    browser_executable_path: Option<String>,
    #[serde(default)]
    browser_args: Vec<String>,
    #[serde(default)]
    browser_env: Option<String>,
    #[serde(default)]
    firefox_prefs: Option<String>,
    #[serde(default)]
    ignore_default_args: Option<String>,
    #[serde(default)]
    default_proxy: Option<String>,

    #[serde(default = "default_network_diagnostics")]
    network_diagnostics: Vec<String>,
    #[serde(default = "default_diagnostics_timeout")]
    diagnostics_timeout_seconds: f64,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8070
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".into()]
}
fn default_metrics_endpoint() -> String {
    "/metrics".into()
}
fn default_cleanup_interval() -> u64 {
    15
}
fn default_idle_ttl() -> u64 {
    300
}
fn default_prewarm_interval() -> u64 {
    30
}
fn default_display_min() -> u32 {
    100
}
fn default_display_max() -> u32 {
    199
}
fn default_vnc_port_min() -> u16 {
    5900
}
fn default_vnc_port_max() -> u16 {
    5999
}
fn default_ws_port_min() -> u16 {
    6900
}
fn default_ws_port_max() -> u16 {
    6999
}
fn default_resolution() -> String {
    "1920x1080x24".into()
}
fn default_web_assets_path() -> Option<String> {
    Some("/usr/share/novnc".into())
}
fn default_startup_timeout() -> f64 {
    5.0
}
fn default_node_path() -> String {
    "node".into()
}
fn default_cli_path() -> String {
    "/opt/camoufox/driver/cli.js".into()
}
fn default_browser_name() -> String {
    "firefox".into()
}
fn default_launch_timeout() -> u64 {
    45
}
fn default_network_diagnostics() -> Vec<String> {
    vec!["https://bot.sannysoft.com".into()]
}
fn default_diagnostics_timeout() -> f64 {
    8.0
}
