//! Entry point for the Camofleet control plane.

use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use camofleet_control::app::create_app;
use camofleet_control::config::ControlSettings;
use camofleet_control::state::AppState;
use camofleet_shared::shutdown_signal;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = match ControlSettings::load() {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let state = match AppState::new(settings.clone()) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "failed to build worker clients");
            return ExitCode::FAILURE;
        }
    };

    let app = create_app(state.clone());
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr, error = %err, "failed to bind");
            return ExitCode::FAILURE;
        }
    };

    info!(addr, "camofleet control plane listening");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "server error");
    }

    state.clients.close();
    ExitCode::SUCCESS
}
