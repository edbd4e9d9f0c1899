//! Management of virtual display (VNC) subprocess chains.
//!
//! A VNC session is a chain of three helpers launched in order — Xvfb on a
//! reserved display, x11vnc exporting its framebuffer on a loopback RFB
//! port, websockify bridging that port to a WebSocket — each gated by a
//! readiness probe. Teardown runs in reverse order and always returns the
//! slot to the pool.

use std::path::Path;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RunnerSettings;
use crate::error::{ExitStatusLabel, RunnerError};
use crate::models::VncInfo;
use crate::pool::{VncResourcePool, VncSlot};
use crate::processes::{cancel_drain_tasks, spawn_process, terminate_process};

const DISPLAY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runtime information for a launched VNC toolchain.
pub struct VncSession {
    pub slot: VncSlot,
    pub display: String,
    pub http_url: Option<String>,
    pub ws_url: Option<String>,
    processes: Vec<Child>,
    drain_tasks: Vec<JoinHandle<()>>,
}

impl VncSession {
    /// Serialized VNC connection info for API responses.
    pub fn payload(&self) -> VncInfo {
        VncInfo {
            ws: self.ws_url.clone(),
            http: self.http_url.clone(),
            password_protected: false,
        }
    }
}

/// Start and stop VNC-related subprocesses for sessions.
pub struct VncProcessManager {
    pool: VncResourcePool,
    available: bool,
    resolution: String,
    web_assets_path: Option<String>,
    startup_timeout: Duration,
    http_base: Option<String>,
    ws_base: Option<String>,
}

impl VncProcessManager {
    pub fn new(settings: &RunnerSettings) -> Self {
        let available = ["Xvfb", "x11vnc", "websockify"]
            .iter()
            .all(|tool| which::which(tool).is_ok());
        if !available {
            info!("VNC tooling not available; disabling VNC support");
        }
        Self {
            pool: VncResourcePool::new(
                settings.vnc_display_min..=settings.vnc_display_max,
                settings.vnc_port_min..=settings.vnc_port_max,
                settings.vnc_ws_port_min..=settings.vnc_ws_port_max,
            ),
            available,
            resolution: settings.vnc_resolution.clone(),
            web_assets_path: settings.vnc_web_assets_path.clone(),
            startup_timeout: Duration::from_secs_f64(settings.vnc_startup_timeout_seconds),
            http_base: settings.vnc_http_base.clone(),
            ws_base: settings.vnc_ws_base.clone(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn pool(&self) -> &VncResourcePool {
        &self.pool
    }

    /// Launch the full toolchain for a new session.
    pub async fn start_session(&self) -> Result<VncSession, RunnerError> {
        if !self.available {
            return Err(RunnerError::VncUnavailable);
        }

        let slot = self.pool.acquire().await?;
        match self.launch_chain(slot).await {
            Ok(session) => Ok(session),
            Err(err) => {
                self.pool.release(slot).await;
                Err(err)
            }
        }
    }

    async fn launch_chain(&self, slot: VncSlot) -> Result<VncSession, RunnerError> {
        let display_name = format!(":{}", slot.display);
        let mut processes: Vec<Child> = Vec::new();
        let mut drain_tasks: Vec<JoinHandle<()>> = Vec::new();

        let result = self
            .launch_chain_inner(slot, &display_name, &mut processes, &mut drain_tasks)
            .await;
        match result {
            Ok((http_url, ws_url)) => Ok(VncSession {
                slot,
                display: display_name,
                http_url,
                ws_url,
                processes,
                drain_tasks,
            }),
            Err(err) => {
                terminate_chain(&mut processes, std::mem::take(&mut drain_tasks)).await;
                Err(err)
            }
        }
    }

    async fn launch_chain_inner(
        &self,
        slot: VncSlot,
        display_name: &str,
        processes: &mut Vec<Child>,
        drain_tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<(Option<String>, Option<String>), RunnerError> {
        debug!(
            display = display_name,
            vnc_port = slot.vnc_port,
            ws_port = slot.ws_port,
            "allocating VNC slot"
        );

        let mut xvfb = Command::new("Xvfb");
        xvfb.args([
            display_name,
            "-screen",
            "0",
            &self.resolution,
            "+extension",
            "RANDR",
            "-nolisten",
            "tcp",
        ]);
        let (mut child, tasks) = spawn_process(xvfb, &format!("vnc-xvfb:{}", slot.display))?;
        drain_tasks.extend(tasks);
        let ready = self.wait_for_display_socket(slot, &mut child).await;
        processes.push(child);
        ready?;

        let mut x11vnc = Command::new("x11vnc");
        x11vnc.args([
            "-display",
            display_name,
            "-shared",
            "-forever",
            "-rfbport",
            &slot.vnc_port.to_string(),
            "-localhost",
            "-nopw",
            "-quiet",
        ]);
        let (mut child, tasks) = spawn_process(x11vnc, &format!("vnc-x11vnc:{}", slot.display))?;
        drain_tasks.extend(tasks);
        let ready = self.wait_for_port(slot.vnc_port, &mut child, "x11vnc").await;
        processes.push(child);
        ready?;

        let mut websockify = Command::new("websockify");
        if let Some(assets) = &self.web_assets_path {
            if Path::new(assets).is_dir() {
                websockify.arg(format!("--web={assets}"));
            }
        }
        websockify.arg(slot.ws_port.to_string());
        websockify.arg(format!("127.0.0.1:{}", slot.vnc_port));
        let (mut child, tasks) =
            spawn_process(websockify, &format!("vnc-websockify:{}", slot.ws_port))?;
        drain_tasks.extend(tasks);
        let ready = self.wait_for_port(slot.ws_port, &mut child, "websockify").await;
        processes.push(child);
        ready?;

        let http_url = compose_public_url(
            self.http_base.as_deref(),
            slot.ws_port,
            "/vnc.html",
            Some(vec![("path".to_string(), "websockify".to_string())]),
        );
        let ws_url = compose_public_url(self.ws_base.as_deref(), slot.ws_port, "/websockify", None);

        Ok((http_url, ws_url))
    }

    /// Terminate helper processes and return the slot to the pool.
    pub async fn stop_session(&self, session: Option<VncSession>) {
        let Some(mut session) = session else {
            return;
        };
        terminate_chain(
            &mut session.processes,
            std::mem::take(&mut session.drain_tasks),
        )
        .await;
        self.pool.release(session.slot).await;
    }

    async fn wait_for_display_socket(
        &self,
        slot: VncSlot,
        process: &mut Child,
    ) -> Result<(), RunnerError> {
        let socket_path = format!("/tmp/.X11-unix/X{}", slot.display);
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if Path::new(&socket_path).exists() {
                return Ok(());
            }
            if let Ok(Some(status)) = process.try_wait() {
                return Err(RunnerError::ProcessExited {
                    component: "Xvfb".into(),
                    code: ExitStatusLabel(status.code()),
                });
            }
            if Instant::now() >= deadline {
                return Err(RunnerError::ReadinessTimeout {
                    what: format!("Xvfb display {}", slot.display),
                });
            }
            sleep(DISPLAY_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_port(
        &self,
        port: u16,
        process: &mut Child,
        component: &str,
    ) -> Result<(), RunnerError> {
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => {
                    drop(stream);
                    return Ok(());
                }
                Err(_) => {
                    if let Ok(Some(status)) = process.try_wait() {
                        return Err(RunnerError::ProcessExited {
                            component: component.into(),
                            code: ExitStatusLabel(status.code()),
                        });
                    }
                    if Instant::now() >= deadline {
                        return Err(RunnerError::ReadinessTimeout {
                            what: format!("{component} on 127.0.0.1:{port}"),
                        });
                    }
                    sleep(PORT_POLL_INTERVAL).await;
                }
            }
        }
    }
}

/// Kill helper processes in reverse launch order, then cancel drain tasks.
async fn terminate_chain(processes: &mut Vec<Child>, drain_tasks: Vec<JoinHandle<()>>) {
    for child in processes.iter_mut().rev() {
        terminate_process(child, true).await;
    }
    cancel_drain_tasks(drain_tasks).await;
    processes.clear();
}

/// Build an externally reachable URL for VNC clients.
///
/// The allocated `ws_port` becomes the URL port unless the base pins its own
/// port alongside a path or query. A `target_port` query parameter is always
/// present, and a `path` query value is prefixed with the base path segment
/// unless it already carries it.
///
/// A scheme-relative base (`//host/...`) falls back to `https` for viewer
/// pages and `ws` otherwise; a base with neither scheme nor authority has
/// no usable host and yields no URL.
pub fn compose_public_url(
    base: Option<&str>,
    port: u16,
    path_suffix: &str,
    query_params: Option<Vec<(String, String)>>,
) -> Option<String> {
    let base = base?;
    let with_scheme = if base.contains("://") {
        base.to_string()
    } else if base.starts_with("//") {
        let default_scheme = if path_suffix.ends_with(".html") {
            "https"
        } else {
            "ws"
        };
        format!("{default_scheme}:{base}")
    } else {
        warn!(base, "unable to determine hostname for VNC base URL");
        return None;
    };
    let parsed = match Url::parse(&with_scheme) {
        Ok(url) => url,
        Err(err) => {
            warn!(base, error = %err, "invalid VNC base URL");
            return None;
        }
    };

    let Some(host) = parsed.host_str() else {
        warn!(base, "unable to determine hostname for VNC base URL");
        return None;
    };

    let mut userinfo = String::new();
    if !parsed.username().is_empty() {
        userinfo.push_str(parsed.username());
        if let Some(password) = parsed.password() {
            userinfo.push(':');
            userinfo.push_str(password);
        }
        userinfo.push('@');
    }

    let base_path = parsed.path().trim_end_matches('/').to_string();
    let has_query = parsed.query().is_some_and(|q| !q.is_empty());

    // An explicit base port only wins when the base also pins a path or
    // query; a bare host:port base still points at the per-session port.
    let effective_port = match parsed.port() {
        Some(explicit) if !base_path.is_empty() || has_query => explicit,
        _ => port,
    };

    let mut combined_path = if path_suffix.is_empty() {
        if base_path.is_empty() {
            "/".to_string()
        } else {
            base_path.clone()
        }
    } else {
        format!("{base_path}{path_suffix}")
    };
    if !combined_path.starts_with('/') {
        combined_path = format!("/{combined_path}");
    }

    let mut query_items: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if let Some(mut params) = query_params {
        let base_segment = base_path.trim_start_matches('/').to_string();
        if !base_segment.is_empty() {
            if let Some(path_value) = params
                .iter_mut()
                .find(|(key, _)| key == "path")
                .map(|(_, value)| value)
            {
                let trimmed = path_value.trim_start_matches('/').to_string();
                let already_prefixed =
                    trimmed == base_segment || trimmed.starts_with(&format!("{base_segment}/"));
                *path_value = if already_prefixed {
                    trimmed
                } else if trimmed.is_empty() {
                    base_segment.clone()
                } else {
                    format!("{base_segment}/{trimmed}")
                };
            }
        }
        query_items.extend(params);
    }
    if !query_items.iter().any(|(key, _)| key == "target_port") {
        query_items.push(("target_port".to_string(), port.to_string()));
    }

    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(query_items.iter())
        .finish();

    Some(format!(
        "{}://{}{}:{}{}?{}",
        parsed.scheme(),
        userinfo,
        host_for_netloc(host),
        effective_port,
        combined_path,
        query
    ))
}

/// Bracket bare IPv6 hosts so they survive the netloc join.
fn host_for_netloc(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}
