//! Shared building blocks for the Camofleet services.

pub mod bridge;
pub mod http;

pub use bridge::bridge_websocket;
pub use http::{cors_layer, shutdown_signal};

/// Version reported by every service in its health payload.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
