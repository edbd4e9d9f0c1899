//! Camofleet VNC gateway.
//!
//! Presents a single externally visible host:port that multiplexes over
//! many backend RFB/WebSocket ports on a loopback runner, selecting the
//! upstream per request through a `target_port` value found in the query,
//! the referer, or a sticky cookie.

pub mod app;
pub mod config;
pub mod gate;
pub mod target;
