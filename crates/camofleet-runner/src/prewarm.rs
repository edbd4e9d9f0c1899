//! Prewarm pool: ready-to-claim browser servers for fast allocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::browser::{BrowserLauncher, SubprocessBrowserServer};
use crate::config::RunnerSettings;
use crate::vnc::{VncProcessManager, VncSession};

/// A ready-to-use bundle containing a browser server and optional VNC
/// toolchain.
pub struct PrewarmedResource {
    pub server: SubprocessBrowserServer,
    pub vnc_session: Option<VncSession>,
    pub headless: bool,
}

#[derive(Default)]
struct Inventory {
    headless: Vec<PrewarmedResource>,
    vnc: Vec<PrewarmedResource>,
}

/// Maintain pools of prewarmed resources to cut cold-start latency.
///
/// Sessions with a per-request proxy override never come from here: their
/// launch config cannot be predicted ahead of time.
pub struct PrewarmPool {
    launcher: Arc<BrowserLauncher>,
    vnc_manager: Arc<VncProcessManager>,
    headless_target: usize,
    vnc_target: usize,
    check_interval: Duration,
    inventory: Mutex<Inventory>,
    // Serialises top-up rounds; a kick arriving mid-round is dropped.
    top_up_gate: Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl PrewarmPool {
    pub fn new(
        settings: &RunnerSettings,
        launcher: Arc<BrowserLauncher>,
        vnc_manager: Arc<VncProcessManager>,
    ) -> Self {
        let vnc_target = if vnc_manager.is_available() {
            settings.prewarm_vnc
        } else {
            0
        };
        if settings.prewarm_vnc > 0 && !vnc_manager.is_available() {
            info!("VNC tooling unavailable; disabling VNC prewarm");
        }
        Self {
            launcher,
            vnc_manager,
            headless_target: settings.prewarm_headless,
            vnc_target,
            check_interval: Duration::from_secs(settings.prewarm_check_interval_seconds),
            inventory: Mutex::new(Inventory::default()),
            top_up_gate: Mutex::new(()),
            task: Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    fn requires_background_loop(&self) -> bool {
        self.headless_target > 0 || self.vnc_target > 0
    }

    /// Perform an initial top-up and start the background maintainer.
    pub async fn start(self: &Arc<Self>) {
        if !self.requires_background_loop() {
            return;
        }
        self.top_up_once().await;
        let pool = Arc::clone(self);
        let mut task = self.task.lock().await;
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(pool.check_interval).await;
                pool.top_up_once().await;
            }
        }));
    }

    /// Stop background work and drain all prewarmed resources.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        self.drain().await;
    }

    async fn drain(&self) {
        let resources = {
            let mut inventory = self.inventory.lock().await;
            let mut drained: Vec<PrewarmedResource> = inventory.headless.drain(..).collect();
            drained.extend(inventory.vnc.drain(..));
            drained
        };
        for mut item in resources {
            item.server.close().await;
            self.vnc_manager.stop_session(item.vnc_session.take()).await;
        }
    }

    /// Pop a matching prewarmed entry if one is available.
    pub async fn acquire(&self, vnc: bool, headless: bool) -> Option<PrewarmedResource> {
        let mut inventory = self.inventory.lock().await;
        if vnc {
            return inventory.vnc.pop();
        }
        if headless {
            return inventory.headless.pop();
        }
        None
    }

    /// Kick one top-up round without blocking the caller.
    pub fn request_top_up(self: &Arc<Self>) {
        if !self.requires_background_loop() || self.closing.load(Ordering::SeqCst) {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.top_up_once().await;
        });
    }

    /// Top up both pools to their targets. At most one round runs at a time.
    pub async fn top_up_once(&self) {
        let Ok(_gate) = self.top_up_gate.try_lock() else {
            return;
        };

        let (need_headless, need_vnc) = {
            let inventory = self.inventory.lock().await;
            (
                self.headless_target.saturating_sub(inventory.headless.len()),
                self.vnc_target.saturating_sub(inventory.vnc.len()),
            )
        };

        for _ in 0..need_headless {
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            match self.launcher.launch(true, None, None).await {
                Ok(server) => {
                    let mut inventory = self.inventory.lock().await;
                    inventory.headless.push(PrewarmedResource {
                        server,
                        vnc_session: None,
                        headless: true,
                    });
                }
                Err(err) => {
                    warn!(error = %err, "failed to prewarm headless server");
                    break;
                }
            }
        }

        for _ in 0..need_vnc {
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            let vnc_session = match self.vnc_manager.start_session().await {
                Ok(session) => session,
                Err(err) => {
                    warn!(error = %err, "failed to prewarm VNC toolchain");
                    break;
                }
            };
            match self
                .launcher
                .launch(false, Some(vnc_session.display.as_str()), None)
                .await
            {
                Ok(server) => {
                    let mut inventory = self.inventory.lock().await;
                    inventory.vnc.push(PrewarmedResource {
                        server,
                        vnc_session: Some(vnc_session),
                        headless: false,
                    });
                }
                Err(err) => {
                    warn!(error = %err, "failed to prewarm VNC server");
                    // Give the pre-acquired slot back before bailing out.
                    self.vnc_manager.stop_session(Some(vnc_session)).await;
                    break;
                }
            }
        }
    }

    /// Current inventory sizes (headless, vnc).
    pub async fn inventory_sizes(&self) -> (usize, usize) {
        let inventory = self.inventory.lock().await;
        (inventory.headless.len(), inventory.vnc.len())
    }
}
