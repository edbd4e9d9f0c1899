//! Entry point for the Camofleet worker service.

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use camofleet_shared::shutdown_signal;
use camofleet_worker::app::{create_app, AppState};
use camofleet_worker::config::WorkerSettings;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = match WorkerSettings::load() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let state = match AppState::new(settings.clone()) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(error = %err, "failed to build runner client");
            return ExitCode::FAILURE;
        }
    };

    let app = create_app(state);
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr, error = %err, "failed to bind");
            return ExitCode::FAILURE;
        }
    };

    info!(addr, "camofleet worker listening");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "server error");
    }
    ExitCode::SUCCESS
}
