//! Entry point for the Camofleet VNC gateway.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use camofleet_shared::shutdown_signal;
use camofleet_vnc_gateway::app::{create_app, AppState};
use camofleet_vnc_gateway::config::GatewaySettings;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = match GatewaySettings::load() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let state = match AppState::new(settings.clone()) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "failed to build HTTP client");
            return ExitCode::FAILURE;
        }
    };

    let app = create_app(Arc::clone(&state));
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr, error = %err, "failed to bind");
            return ExitCode::FAILURE;
        }
    };

    info!(addr, "camofleet vnc gateway listening");
    let gate = Arc::clone(&state.gate);
    let grace = Duration::from_millis(settings.shutdown_grace_ms);
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("draining VNC sessions");
            gate.begin_shutdown(grace).await;
        })
        .await
    {
        error!(error = %err, "server error");
    }
    ExitCode::SUCCESS
}
