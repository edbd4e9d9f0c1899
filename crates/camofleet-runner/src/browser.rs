//! Launching browser-server subprocesses through the driver binary.
//!
//! The driver is invoked as `<node> <cli> launch-server --browser=<name>
//! --config=<json>` and prints exactly one line on stdout: the WebSocket
//! endpoint of the freshly started server. Everything after that line is
//! diagnostic output.

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::config::{LaunchProfile, RunnerSettings};
use crate::error::{ExitStatusLabel, RunnerError};
use crate::models::ProxyConfig;
use crate::processes::{cancel_drain_tasks, terminate_process};

/// Wrap a spawned browser-server process.
#[derive(Debug)]
pub struct SubprocessBrowserServer {
    child: Child,
    pub ws_endpoint: String,
    drain_tasks: Vec<JoinHandle<()>>,
}

impl SubprocessBrowserServer {
    /// Terminate the subprocess and cancel background drain tasks.
    /// Calling this twice is a no-op.
    pub async fn close(&mut self) {
        terminate_process(&mut self.child, false).await;
        cancel_drain_tasks(std::mem::take(&mut self.drain_tasks)).await;
    }
}

/// Create browser-server subprocesses from the configured launch profile.
pub struct BrowserLauncher {
    node_path: String,
    cli_path: String,
    browser_name: String,
    launch_timeout: Duration,
    profile: LaunchProfile,
}

impl BrowserLauncher {
    pub fn from_settings(settings: &RunnerSettings) -> Self {
        Self {
            node_path: settings.driver_node_path.clone(),
            cli_path: settings.driver_cli_path.clone(),
            browser_name: settings.browser_name.clone(),
            launch_timeout: Duration::from_secs(settings.browser_launch_timeout_seconds),
            profile: settings.launch_profile.clone(),
        }
    }

    /// Launch a new browser server and wait for its WebSocket endpoint.
    pub async fn launch(
        &self,
        headless: bool,
        display: Option<&str>,
        override_proxy: Option<&ProxyConfig>,
    ) -> Result<SubprocessBrowserServer, RunnerError> {
        let config = build_launch_config(&self.profile, headless, display, override_proxy);

        // The temp file lives until this function returns, covering every
        // exit path.
        let mut config_file = tempfile::NamedTempFile::new()?;
        serde_json::to_writer(&mut config_file, &config)
            .map_err(|err| std::io::Error::other(err))?;
        config_file.write_all(b"\n")?;
        config_file.flush()?;
        let config_path = config_file.path().to_string_lossy().into_owned();

        let mut command = Command::new(&self.node_path);
        command
            .arg(&self.cli_path)
            .arg("launch-server")
            .arg(format!("--browser={}", self.browser_name))
            .arg(format!("--config={config_path}"))
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("browser server stdout not captured"))?;
        let mut stdout_lines = BufReader::new(stdout).lines();

        let first_line = match timeout(self.launch_timeout, stdout_lines.next_line()).await {
            Ok(result) => result?,
            Err(_) => {
                terminate_process(&mut child, false).await;
                return Err(RunnerError::BrowserLaunch {
                    code: ExitStatusLabel(None),
                    message: "timed out waiting for the WebSocket endpoint".into(),
                });
            }
        };

        let Some(raw_endpoint) = first_line.filter(|line| !line.trim().is_empty()) else {
            // The child died before printing its endpoint; collect stderr
            // for the error message.
            let mut stderr_output = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut stderr_output).await;
            }
            let status = child.wait().await?;
            let message = stderr_output.trim();
            return Err(RunnerError::BrowserLaunch {
                code: ExitStatusLabel(status.code()),
                message: if message.is_empty() {
                    "unknown error".into()
                } else {
                    message.to_string()
                },
            });
        };

        let ws_endpoint = raw_endpoint.trim().to_string();
        let stdout_task = tokio::spawn(async move {
            while let Ok(Some(line)) = stdout_lines.next_line().await {
                debug!("browser-server-stdout: {line}");
            }
        });
        let mut drain_tasks = vec![stdout_task];
        if let Some(stderr) = child.stderr.take() {
            drain_tasks.push(tokio::spawn(crate::processes::drain_stream(
                stderr,
                "browser-server-stderr".into(),
            )));
        }

        Ok(SubprocessBrowserServer {
            child,
            ws_endpoint,
            drain_tasks,
        })
    }
}

/// Assemble the JSON config handed to the driver.
fn build_launch_config(
    profile: &LaunchProfile,
    headless: bool,
    display: Option<&str>,
    override_proxy: Option<&ProxyConfig>,
) -> serde_json::Value {
    let mut env: HashMap<String, String> = profile.env.clone();
    if let Some(display) = display {
        env.insert("DISPLAY".into(), display.to_string());
    }

    let mut config = json!({
        "headless": headless,
        "args": profile.args,
        "env": env,
    });
    let map = config.as_object_mut().unwrap();
    if let Some(path) = &profile.executable_path {
        map.insert("executablePath".into(), json!(path));
    }
    if let Some(prefs) = &profile.firefox_prefs {
        map.insert("firefoxUserPrefs".into(), prefs.clone());
    }
    if let Some(proxy) = override_proxy.or(profile.proxy.as_ref()) {
        map.insert("proxy".into(), json!(proxy));
    }
    if let Some(ignored) = &profile.ignore_default_args {
        map.insert("ignoreDefaultArgs".into(), json!(ignored));
    }
    config
}
