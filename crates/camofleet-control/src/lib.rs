//! Camofleet control plane — the fleet entry point.
//!
//! Selects one worker per request (round-robin or by name, with a VNC
//! capability filter), fans listings out concurrently, rewrites internal
//! URLs into externally reachable ones and bridges client WebSockets down
//! to the chosen worker.

pub mod app;
pub mod config;
pub mod metrics;
pub mod models;
pub mod service;
pub mod state;
pub mod urls;
pub mod vnc;
