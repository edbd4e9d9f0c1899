//! Camofleet worker — a thin forwarding layer in front of one runner.
//!
//! The worker translates the public session schema into runner calls,
//! stamps every descriptor with its process-lifetime `worker_id`, and
//! bridges session WebSockets from callers down to the runner-local
//! browser-server endpoint.

pub mod app;
pub mod config;
pub mod models;
pub mod runner_client;
