//! Service metadata, liveness and readiness endpoints.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::server::state::SharedState;
use crate::session::Readiness;
use crate::traits::SessionFactory;

/// GET / - service metadata
pub async fn root<F: SessionFactory>(State(state): State<SharedState<F>>) -> Json<Value> {
    Json(json!({
        "service": state.config.service_name,
        "version": state.config.service_version,
        "endpoints": {
            "health": "/health",
            "ready": "/ready",
            "warm": "/warm (POST)",
            "remove_background": "/remove-background (POST)",
        },
    }))
}

/// GET /health - liveness
pub async fn health<F: SessionFactory>(State(state): State<SharedState<F>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": state.config.service_name,
        "timestamp": Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
    }))
}

/// GET /ready - 200 once the model session exists, 503 otherwise.
///
/// A failing probe reports not ready here; only the upload route fails open.
pub async fn ready<F: SessionFactory>(
    State(state): State<SharedState<F>>,
) -> (StatusCode, Json<Value>) {
    let model = state.model_id();
    let ready = match state.cache.readiness(model) {
        Ok(readiness) => readiness == Readiness::Ready,
        Err(e) => {
            tracing::warn!(error = %e, "readiness probe failed");
            false
        }
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ready": ready, "model": model })))
}
