//! Error types shared across the runner subsystems.

use std::fmt;

/// Failure modes surfaced by session orchestration.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// VNC tooling is missing on this node or was disabled.
    #[error("VNC is not supported on this runner")]
    VncUnavailable,

    /// The display/port pool is exhausted.
    #[error("no available VNC slots")]
    NoCapacity,

    /// The browser-server child exited or timed out before printing its
    /// WebSocket endpoint.
    #[error("failed to launch browser server ({code}): {message}")]
    BrowserLaunch { code: ExitStatusLabel, message: String },

    /// A helper process in the virtual-display chain died during start-up.
    #[error("{component} exited with code {code}")]
    ProcessExited { component: String, code: ExitStatusLabel },

    /// A readiness probe gave up waiting.
    #[error("timed out waiting for {what}")]
    ReadinessTimeout { what: String },

    /// New sessions are rejected once shutdown has begun.
    #[error("runner is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Human-readable exit status; a child that was killed has no code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatusLabel(pub Option<i32>);

impl fmt::Display for ExitStatusLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "code {code}"),
            None => write!(f, "signal"),
        }
    }
}

/// Configuration problems that must abort start-up.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid runner configuration: {0}")]
    Invalid(String),

    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),
}
