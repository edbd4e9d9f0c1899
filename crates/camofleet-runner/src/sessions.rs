//! Session orchestration for the runner service.
//!
//! `SessionManager` composes the dedicated subsystems that keep browser
//! sessions alive — the browser launcher, the VNC process manager, the
//! prewarm pool and the cleanup scheduler — and focuses on bookkeeping:
//! the session table, lifecycle transitions and teardown ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::{BrowserLauncher, SubprocessBrowserServer};
use crate::cleanup::{is_expired, CleanupScheduler};
use crate::config::RunnerSettings;
use crate::error::RunnerError;
use crate::models::{
    SessionCreateRequest, SessionDeleteResponse, SessionDetail, SessionStatus, SessionSummary,
    StartUrlWait, VncInfo,
};
use crate::preload::{preload_start_url, PreloadController};
use crate::prewarm::PrewarmPool;
use crate::urls::navigable_start_url;
use crate::vnc::{VncProcessManager, VncSession};

/// In-memory representation of a live session.
pub struct SessionHandle {
    pub id: String,
    pub headless: bool,
    pub idle_ttl_seconds: u64,
    pub created_at: chrono::DateTime<Utc>,
    pub last_seen_at: chrono::DateTime<Utc>,
    pub server: SubprocessBrowserServer,
    pub vnc: bool,
    pub start_url: Option<String>,
    pub labels: HashMap<String, String>,
    pub status: SessionStatus,
    pub vnc_session: Option<VncSession>,
    pub start_url_wait: StartUrlWait,
    pub controller: Option<PreloadController>,
}

impl SessionHandle {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            status: self.status,
            created_at: self.created_at,
            last_seen_at: self.last_seen_at,
            headless: self.headless,
            idle_ttl_seconds: self.idle_ttl_seconds,
            labels: self.labels.clone(),
            vnc: self.vnc,
            start_url_wait: self.start_url_wait,
        }
    }

    pub fn detail(&self) -> SessionDetail {
        let vnc_info = match (&self.vnc_session, self.vnc) {
            (Some(session), true) => session.payload(),
            _ => VncInfo::disabled(),
        };
        SessionDetail {
            summary: self.summary(),
            ws_endpoint: self.server.ws_endpoint.clone(),
            vnc_info,
        }
    }
}

/// Manage the lifecycle of sessions and the supporting background tasks.
pub struct SessionManager {
    settings: RunnerSettings,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    launcher: Arc<BrowserLauncher>,
    vnc_manager: Arc<VncProcessManager>,
    prewarm: Arc<PrewarmPool>,
    cleanup: Mutex<Option<CleanupScheduler>>,
    preload_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl SessionManager {
    pub fn new(settings: RunnerSettings) -> Arc<Self> {
        let launcher = Arc::new(BrowserLauncher::from_settings(&settings));
        let vnc_manager = Arc::new(VncProcessManager::new(&settings));
        let prewarm = Arc::new(PrewarmPool::new(
            &settings,
            Arc::clone(&launcher),
            Arc::clone(&vnc_manager),
        ));
        Arc::new(Self {
            settings,
            sessions: Mutex::new(HashMap::new()),
            launcher,
            vnc_manager,
            prewarm,
            cleanup: Mutex::new(None),
            preload_tasks: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn vnc_available(&self) -> bool {
        self.vnc_manager.is_available()
    }

    /// Start the cleanup loop and the prewarm maintainer.
    pub async fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let scheduler = CleanupScheduler::start(
            Duration::from_secs(self.settings.cleanup_interval),
            move || {
                let manager = Arc::clone(&manager);
                async move {
                    manager.cleanup_expired().await;
                    Ok(())
                }
            },
        );
        *self.cleanup.lock().await = Some(scheduler);
        self.prewarm.start().await;
    }

    /// Stop background workers and terminate all active and prewarmed
    /// sessions.
    pub async fn close(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(mut scheduler) = self.cleanup.lock().await.take() {
            scheduler.stop().await;
        }
        let preloads: Vec<JoinHandle<()>> = {
            let mut tasks = self.preload_tasks.lock().await;
            tasks.drain().map(|(_, task)| task).collect()
        };
        for task in &preloads {
            task.abort();
        }
        for task in preloads {
            let _ = task.await;
        }
        self.prewarm.close().await;
        self.close_all().await;
    }

    async fn close_all(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for mut handle in handles {
            handle.status = SessionStatus::Terminating;
            self.shutdown_handle(&mut handle).await;
        }
    }

    pub async fn list_details(&self) -> Vec<SessionDetail> {
        let sessions = self.sessions.lock().await;
        sessions.values().map(SessionHandle::detail).collect()
    }

    pub async fn get_detail(&self, session_id: &str) -> Option<SessionDetail> {
        let sessions = self.sessions.lock().await;
        sessions.get(session_id).map(SessionHandle::detail)
    }

    /// Bump `last_seen_at` to keep a session alive.
    pub async fn touch(&self, session_id: &str) -> Option<SessionDetail> {
        let mut sessions = self.sessions.lock().await;
        let handle = sessions.get_mut(session_id)?;
        handle.last_seen_at = Utc::now();
        Some(handle.detail())
    }

    /// Remove a session and shut down its processes.
    pub async fn delete(&self, session_id: &str) -> Option<SessionDeleteResponse> {
        let handle = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id)
        };
        let mut handle = handle?;
        handle.status = SessionStatus::Terminating;
        self.shutdown_handle(&mut handle).await;
        Some(SessionDeleteResponse {
            id: handle.id.clone(),
            status: handle.status,
        })
    }

    /// Create a new session, preferring prewarmed resources.
    pub async fn create(
        self: &Arc<Self>,
        request: SessionCreateRequest,
    ) -> Result<SessionDetail, RunnerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RunnerError::ShuttingDown);
        }

        let defaults = &self.settings.session_defaults;
        let mut headless = request.headless.unwrap_or(defaults.headless);
        let vnc_enabled = request.vnc;
        if vnc_enabled {
            headless = false;
            if !self.vnc_manager.is_available() {
                return Err(RunnerError::VncUnavailable);
            }
        }

        let proxy_override = request.proxy;
        let prewarmed = if proxy_override.is_none() {
            self.prewarm.acquire(vnc_enabled, headless).await
        } else {
            None
        };

        let idle_ttl = request
            .idle_ttl_seconds
            .unwrap_or(defaults.idle_ttl_seconds);
        let labels = request.labels.unwrap_or_default();
        let start_url = request.start_url.or_else(|| defaults.start_url.clone());
        let start_url_wait = request
            .start_url_wait
            .unwrap_or(self.settings.start_url_wait);

        let (server, vnc_session) = match prewarmed {
            Some(mut resource) => (resource.server, resource.vnc_session.take()),
            None => {
                let vnc_session = if vnc_enabled {
                    Some(self.vnc_manager.start_session().await?)
                } else {
                    None
                };
                let display = vnc_session.as_ref().map(|s| s.display.clone());
                match self
                    .launcher
                    .launch(headless, display.as_deref(), proxy_override.as_ref())
                    .await
                {
                    Ok(server) => (server, vnc_session),
                    Err(err) => {
                        self.vnc_manager.stop_session(vnc_session).await;
                        return Err(err);
                    }
                }
            }
        };

        let created_at = Utc::now();
        let handle = SessionHandle {
            id: Uuid::new_v4().to_string(),
            headless,
            idle_ttl_seconds: idle_ttl,
            created_at,
            last_seen_at: created_at,
            server,
            vnc: vnc_enabled,
            start_url,
            labels,
            status: SessionStatus::Ready,
            vnc_session,
            start_url_wait,
            controller: None,
        };
        let detail = handle.detail();

        self.schedule_preload(&handle).await;
        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(handle.id.clone(), handle);
        }
        self.prewarm.request_top_up();
        Ok(detail)
    }

    /// Collect and tear down sessions that exceeded their idle timeout.
    pub async fn cleanup_expired(self: &Arc<Self>) {
        let now = Utc::now();
        let stale: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().await;
            let expired_ids: Vec<String> = sessions
                .values()
                .filter(|handle| is_expired(handle.last_seen_at, handle.idle_ttl_seconds, now))
                .map(|handle| handle.id.clone())
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| {
                    sessions.remove(&id).map(|mut handle| {
                        handle.status = SessionStatus::Terminating;
                        handle
                    })
                })
                .collect()
        };
        for mut handle in stale {
            info!(session = %handle.id, "session expired; shutting down");
            self.shutdown_handle(&mut handle).await;
        }
    }

    /// Tear down a session's resources: controller, browser server, VNC
    /// chain, slot — in that order.
    async fn shutdown_handle(&self, handle: &mut SessionHandle) {
        if let Some(mut controller) = handle.controller.take() {
            controller.close().await;
        }
        handle.server.close().await;
        self.vnc_manager.stop_session(handle.vnc_session.take()).await;
        handle.status = SessionStatus::Dead;
    }

    /// Fire and forget the optional start-URL preloading task.
    async fn schedule_preload(self: &Arc<Self>, handle: &SessionHandle) {
        let Some(start_url) = handle.start_url.clone() else {
            return;
        };
        if handle.start_url_wait == StartUrlWait::None {
            return;
        }

        let manager = Arc::clone(self);
        let session_id = handle.id.clone();
        let ws_endpoint = handle.server.ws_endpoint.clone();
        let wait = handle.start_url_wait;
        let task_id = session_id.clone();
        // Holding the registry lock until the handle is stored keeps the
        // task's self-removal from racing the insert.
        let mut registry = self.preload_tasks.lock().await;
        let task = tokio::spawn(async move {
            let url = navigable_start_url(&start_url);
            match preload_start_url(&ws_endpoint, &url, wait).await {
                Ok(mut controller) => {
                    let mut sessions = manager.sessions.lock().await;
                    match sessions.get_mut(&session_id) {
                        Some(handle) => handle.controller = Some(controller),
                        None => {
                            drop(sessions);
                            // Session vanished while we were navigating.
                            controller.close().await;
                        }
                    }
                }
                Err(err) => {
                    warn!(session = %session_id, url = %start_url, error = %err, "failed to preload start URL");
                }
            }
            manager.preload_tasks.lock().await.remove(&session_id);
        });
        registry.insert(task_id, task);
    }

    /// Prewarm inventory sizes, used by tests and diagnostics.
    pub async fn prewarm_sizes(&self) -> (usize, usize) {
        self.prewarm.inventory_sizes().await
    }
}
