//! Shared HTTP clients for talking to workers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::WorkerConfig;

/// Cache of `reqwest` clients keyed by `(worker name, base url)` so a
/// config reload with a changed URL gets a fresh connection pool instead
/// of leaking sockets into the old one.
pub struct WorkerClientPool {
    template: reqwest::Client,
    clients: Mutex<HashMap<(String, String), reqwest::Client>>,
}

impl WorkerClientPool {
    pub fn new(timeout_seconds: f64) -> Result<Self, reqwest::Error> {
        Ok(Self {
            template: reqwest::Client::builder()
                .timeout(Duration::from_secs_f64(timeout_seconds))
                .build()?,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Return the pooled client for a worker, creating it on first use.
    pub fn client_for(&self, worker: &WorkerConfig) -> reqwest::Client {
        let key = (worker.name.clone(), worker.url.clone());
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients
            .entry(key)
            .or_insert_with(|| self.template.clone())
            .clone()
    }

    /// Drop every cached client; part of shutdown.
    pub fn close(&self) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.clear();
    }

    /// Build the worker-relative URL for an API path.
    pub fn url_for(worker: &WorkerConfig, path: &str) -> String {
        format!("{}{}", worker.url.trim_end_matches('/'), path)
    }
}
