// src/main.rs

use entra_guard::config::CONFIG_PATH_VAR;
use entra_guard::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), GuardError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config_path = std::env::var(CONFIG_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("appsettings.json"));
    let settings = Settings::from_process_env(Some(&config_path))?;
    let config = settings.validation_config()?;
    let token_file = settings
        .api
        .token_file
        .clone()
        .ok_or_else(|| GuardError::MissingConfiguration("Api:TokenFile".to_string()))?;

    let validator = TokenValidator::new(config);
    let shutdown = CancellationToken::new();

    let refresh = validator
        .config()
        .enabled
        .then(|| validator.metadata().spawn_refresh_loop(shutdown.child_token()));

    let poller = ApiPoller::new(
        validator,
        Arc::new(FileTokenSource::new(token_file)),
        &settings.api,
        ReadinessState::new(),
    )?;
    info!(
        "Polling {} every {:?}",
        settings.api.endpoint, settings.api.poll_interval
    );
    let worker = tokio::spawn(poller.run(shutdown.child_token()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    shutdown.cancel();

    if let Err(e) = worker.await {
        error!("Poller task ended abnormally: {}", e);
    }
    if let Some(refresh) = refresh {
        if let Err(e) = refresh.await {
            error!("Metadata refresh task ended abnormally: {}", e);
        }
    }
    Ok(())
}
