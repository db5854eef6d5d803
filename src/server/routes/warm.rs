use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::server::{error::ApiError, state::SharedState};
use crate::traits::SessionFactory;
use crate::warmup::WarmupOutcome;

/// POST /warm - start building the model session in the background.
///
/// Returns 200 when the session already exists and 202 when a warmup was started
/// or is still running. Poll `/ready` to see when it finishes.
pub async fn warm<F: SessionFactory>(
    State(state): State<SharedState<F>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let outcome = state.warmup.trigger_warm(state.model_id()).map_err(|e| {
        tracing::error!(error = %e, "warm trigger failed");
        ApiError::WarmupTrigger(e)
    })?;

    let (status, detail) = match outcome {
        WarmupOutcome::AlreadyWarm => (StatusCode::OK, "Already warmed"),
        WarmupOutcome::Started => (StatusCode::ACCEPTED, "Warming started"),
        WarmupOutcome::InProgress => (StatusCode::ACCEPTED, "Warming in progress"),
    };
    Ok((status, Json(json!({ "detail": detail, "outcome": outcome }))))
}
