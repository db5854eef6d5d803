use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use bg_removal_rs::{
    server::{self, AppState},
    telemetry, Config, OnnxSessionFactory,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    telemetry::init_tracing(&config.log_level);
    config.validate()?;

    let factory = OnnxSessionFactory {
        model_dir: config.model_dir.clone(),
        num_threads: config.num_threads,
        device_id: config.device_id,
    };
    let model_path = factory.model_path(&config.model_name);
    if !model_path.is_file() {
        warn!(
            path = %model_path.display(),
            "model file not found; warmup and processing will fail until it is provided"
        );
    }

    info!(
        service = %config.service_name,
        version = %config.service_version,
        model = %config.model_name,
        max_file_size = config.max_file_size,
        "starting"
    );

    let state = Arc::new(AppState::new(config, factory));
    let app = server::router(Arc::clone(&state))?;

    let addr = state.config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("listening on http://{addr}");

    // scheduled after bind so the port is open while the model loads
    if state.config.warm_on_startup {
        match state.warmup.trigger_warm(state.model_id()) {
            Ok(outcome) => info!(?outcome, "startup warmup"),
            Err(e) => error!(error = %e, "startup warmup could not be scheduled"),
        }
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if state.warmup.is_warming(state.model_id()) {
        info!("waiting for model warmup to finish");
    }
    state.warmup.wait_idle().await;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
