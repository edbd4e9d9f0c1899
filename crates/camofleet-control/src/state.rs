//! Worker selection and the shared application state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{ControlSettings, WorkerConfig};
use crate::metrics::ControlMetrics;
use crate::service::WorkerClientPool;

/// Why no worker could be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    /// The preferred worker name is unknown (or filtered out).
    NotFound,
    /// The (filtered) worker set is empty.
    NoWorkers,
}

/// Select a worker by name or via round-robin balancing.
///
/// The counter is shared across requests and wraps; strict fairness is not
/// required, but every worker in the filtered set stays selectable forever.
pub fn select_worker<'a>(
    workers: &'a [WorkerConfig],
    preferred: Option<&str>,
    require_vnc: bool,
    counter: &AtomicUsize,
) -> Result<&'a WorkerConfig, SelectError> {
    let filtered: Vec<&WorkerConfig> = workers
        .iter()
        .filter(|worker| !require_vnc || worker.supports_vnc)
        .collect();

    if let Some(name) = preferred {
        return filtered
            .iter()
            .find(|worker| worker.name == name)
            .copied()
            .ok_or(SelectError::NotFound);
    }
    if filtered.is_empty() {
        return Err(SelectError::NoWorkers);
    }
    let index = counter.fetch_add(1, Ordering::Relaxed);
    Ok(filtered[index % filtered.len()])
}

/// Mutable state shared between request handlers.
pub struct AppState {
    pub settings: ControlSettings,
    pub clients: WorkerClientPool,
    pub metrics: ControlMetrics,
    rr_index: AtomicUsize,
}

impl AppState {
    pub fn new(settings: ControlSettings) -> Result<Arc<Self>, reqwest::Error> {
        let clients = WorkerClientPool::new(settings.request_timeout)?;
        Ok(Arc::new(Self {
            settings,
            clients,
            metrics: ControlMetrics::new(),
            rr_index: AtomicUsize::new(0),
        }))
    }

    pub fn pick_worker(
        &self,
        preferred: Option<&str>,
        require_vnc: bool,
    ) -> Result<&WorkerConfig, SelectError> {
        select_worker(
            &self.settings.workers,
            preferred,
            require_vnc,
            &self.rr_index,
        )
    }
}
