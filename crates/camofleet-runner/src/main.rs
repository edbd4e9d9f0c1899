//! Entry point for the Camofleet runner service.

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use camofleet_runner::app::{create_app, AppState};
use camofleet_runner::config::RunnerSettings;
use camofleet_runner::sessions::SessionManager;
use camofleet_shared::shutdown_signal;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = match RunnerSettings::load() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let manager = SessionManager::new(settings.clone());
    manager.start().await;

    let state = AppState::new(&settings, Arc::clone(&manager));
    state.start_diagnostics(&settings);

    let app = create_app(&settings, Arc::clone(&state));
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr, error = %err, "failed to bind");
            manager.close().await;
            return ExitCode::FAILURE;
        }
    };

    info!(addr, "camofleet runner listening");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "server error");
    }

    info!("shutting down camofleet runner");
    state.stop_diagnostics();
    manager.close().await;
    ExitCode::SUCCESS
}
