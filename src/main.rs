mod app_error;
mod cli;
mod config;
mod controllers;
mod events;
mod repositories;
mod services;
mod util;

use crate::cli::Cli;
use crate::config::models::ModelRegistry;
use crate::config::settings::AppSettings;
use crate::controllers::AppState;
use crate::controllers::generate::{post_cancel_generate, post_count_tokens, post_generate};
use crate::controllers::models::{
    delete_model, get_model, get_models, post_load_model, post_models, post_unload_model,
};
use crate::controllers::settings::{get_settings, post_settings};
use crate::repositories::device_memory::{DeviceMemoryOracle, FixedOracle, SmiOracle};
use crate::repositories::sim_engine::SimEngine;
use crate::services::cancel::CancelFlag;
use crate::services::model_manager::ModelManager;
use crate::util::expanduser;
use axum::routing::get;
use axum::{Router, routing::post};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    enable_logging(cli.verbose);

    let data_dir = expanduser(&cli.data_dir);
    let settings_path = data_dir.join("settings.yaml");
    let Some(settings) = AppSettings::from_path(&settings_path) else {
        return Ok(ExitCode::FAILURE);
    };
    let registry = ModelRegistry::load(&data_dir)?;

    // Report what a real accelerator stack would offer, even though the
    // shipped backend simulates its devices.
    if let Some(oracle) = SmiOracle::probe().await {
        let free_mib: Vec<u64> =
            oracle.snapshot().await.iter().map(|b| b / (1024 * 1024)).collect();
        info!(
            "{} accelerator device(s) visible, free MiB per device: {:?}",
            oracle.device_count(),
            free_mib
        );
    } else {
        info!(
            "no accelerator stack detected, simulating devices of {:?} MiB",
            settings.sim_device_mib
        );
    }

    let engine = Arc::new(SimEngine::new(&settings.sim_device_mib));
    let oracle = Arc::new(FixedOracle::from_mib(&settings.sim_device_mib));
    let cancel = CancelFlag::new();
    let manager = ModelManager::new(
        engine,
        oracle,
        registry,
        settings,
        settings_path,
        cancel.clone(),
    );
    let state = AppState { manager: Arc::new(Mutex::new(manager)), cancel };

    let api_router = Router::new()
        .route("/models", get(get_models).post(post_models))
        .route("/models/{id}", get(get_model).delete(delete_model))
        .route("/models/{id}/load", post(post_load_model))
        .route("/unload_model", post(post_unload_model))
        .route("/generate", post(post_generate))
        .route("/cancel_generate", post(post_cancel_generate))
        .route("/count_tokens", post(post_count_tokens))
        .route("/settings", get(get_settings).post(post_settings))
        .with_state(state);
    let app = Router::new().nest("/api", api_router).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods(Any),
    );

    // run it
    let listener = tokio::net::TcpListener::bind(&cli.host).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(ExitCode::SUCCESS)
}

fn enable_logging(verbose: u8) {
    let log_level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
