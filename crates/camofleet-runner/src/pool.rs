//! Allocation of display/port triples for VNC sessions.

use std::collections::{HashSet, VecDeque};

use tokio::sync::Mutex;

use crate::error::RunnerError;

/// One reserved display slot with its two network ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VncSlot {
    pub display: u32,
    pub vnc_port: u16,
    pub ws_port: u16,
}

struct PoolInner {
    displays: VecDeque<u32>,
    vnc_ports: VecDeque<u16>,
    ws_ports: VecDeque<u16>,
    active: HashSet<VncSlot>,
}

/// Track and allocate VNC slots across concurrent sessions.
///
/// Queues are FIFO so a released port sits at the back of the line while
/// the operating system may still hold it in TIME_WAIT.
pub struct VncResourcePool {
    inner: Mutex<PoolInner>,
}

impl VncResourcePool {
    pub fn new(
        displays: impl IntoIterator<Item = u32>,
        vnc_ports: impl IntoIterator<Item = u16>,
        ws_ports: impl IntoIterator<Item = u16>,
    ) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                displays: displays.into_iter().collect(),
                vnc_ports: vnc_ports.into_iter().collect(),
                ws_ports: ws_ports.into_iter().collect(),
                active: HashSet::new(),
            }),
        }
    }

    /// Reserve a display/port triple.
    pub async fn acquire(&self) -> Result<VncSlot, RunnerError> {
        let mut inner = self.inner.lock().await;
        let (Some(display), Some(vnc_port), Some(ws_port)) = (
            inner.displays.front().copied(),
            inner.vnc_ports.front().copied(),
            inner.ws_ports.front().copied(),
        ) else {
            return Err(RunnerError::NoCapacity);
        };
        inner.displays.pop_front();
        inner.vnc_ports.pop_front();
        inner.ws_ports.pop_front();
        let slot = VncSlot {
            display,
            vnc_port,
            ws_port,
        };
        inner.active.insert(slot);
        Ok(slot)
    }

    /// Return a slot to the pool. Unknown slots are ignored so release is
    /// idempotent.
    pub async fn release(&self, slot: VncSlot) {
        let mut inner = self.inner.lock().await;
        if !inner.active.remove(&slot) {
            return;
        }
        inner.displays.push_back(slot.display);
        inner.vnc_ports.push_back(slot.vnc_port);
        inner.ws_ports.push_back(slot.ws_port);
    }

    /// Number of slots currently handed out.
    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    /// Number of slots still available.
    pub async fn free_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .displays
            .len()
            .min(inner.vnc_ports.len())
            .min(inner.ws_ports.len())
    }
}
