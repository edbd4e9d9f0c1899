//! Session admission and drain control for the gateway.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::warn;

/// Why a new session was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    /// The gateway is draining existing sessions.
    ShuttingDown,
    /// The concurrent-session limit is reached.
    CapacityExceeded,
}

struct GateInner {
    active: usize,
    closing: bool,
}

/// Bounds concurrent proxy sessions and coordinates shutdown draining.
pub struct SessionGate {
    max_sessions: usize,
    inner: Mutex<GateInner>,
    drained: Notify,
    closing_tx: watch::Sender<bool>,
}

impl SessionGate {
    pub fn new(max_sessions: usize) -> Self {
        let (closing_tx, _) = watch::channel(false);
        Self {
            max_sessions,
            inner: Mutex::new(GateInner {
                active: 0,
                closing: false,
            }),
            drained: Notify::new(),
            closing_tx,
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).active
    }

    pub fn is_closing(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closing
    }

    /// Admit one session or explain the refusal.
    pub fn acquire(&self) -> Result<(), GateRejection> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closing {
            return Err(GateRejection::ShuttingDown);
        }
        if inner.active >= self.max_sessions {
            return Err(GateRejection::CapacityExceeded);
        }
        inner.active += 1;
        Ok(())
    }

    /// Release one session slot.
    pub fn release(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.active = inner.active.saturating_sub(1);
        if inner.active == 0 {
            self.drained.notify_waiters();
        }
    }

    /// A receiver that flips to `true` once shutdown begins.
    pub fn closing_signal(&self) -> watch::Receiver<bool> {
        self.closing_tx.subscribe()
    }

    /// Flip the closing flag and wait up to `grace` for active sessions to
    /// drain.
    pub async fn begin_shutdown(&self, grace: Duration) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.closing = true;
        }
        let _ = self.closing_tx.send(true);

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.active_sessions() == 0 {
                return;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(
                    active = self.active_sessions(),
                    "timed out waiting for sessions to drain"
                );
                return;
            }
            let _ = tokio::time::timeout(remaining, self.drained.notified()).await;
        }
    }
}
