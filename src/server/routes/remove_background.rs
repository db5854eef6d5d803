//! POST /remove-background
//!
//! Admission → validation → reading → processing → response. Admission looks only
//! at the session cache, so a cold model is rejected before any of the upload is
//! read. Filename and content type are checked from the part headers, before the
//! file bytes are pulled.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::Instrument;
use uuid::Uuid;

use crate::errors::BgRemovalError;
use crate::image_processor::{ImageProcessor, ProcessedImage};
use crate::server::{error::ApiError, state::AppState, state::SharedState, UploadedImage};
use crate::session::Readiness;
use crate::traits::SessionFactory;
use crate::validator::{
    validate_content_type, validate_file_size, validate_filename, validate_image_content,
    validate_not_empty, ValidationError,
};

pub const PROCESSING_TIME_HEADER: &str = "x-processing-time";

/// Multipart field carrying the image.
pub const FILE_FIELD: &str = "file";

pub async fn remove_background<F: SessionFactory>(
    State(state): State<SharedState<F>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let span = tracing::info_span!("remove_background", request_id = %Uuid::new_v4());
    handle(state, multipart).instrument(span).await
}

async fn handle<F: SessionFactory>(
    state: SharedState<F>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let started = Instant::now();

    admit(&state)?;

    let mut multipart = multipart.map_err(|e| ApiError::Multipart(e.body_text()))?;
    let upload = tokio::time::timeout(
        state.config.upload_timeout(),
        read_upload(&mut multipart, state.config.max_file_size),
    )
    .await
    .map_err(|_| {
        tracing::warn!(limit = ?state.config.upload_timeout(), "upload read timed out");
        ApiError::UploadTimeout
    })?
    .inspect_err(|e| tracing::warn!(error = %e, "upload rejected"))?;

    validate_not_empty(&upload.bytes)?;
    validate_file_size(upload.bytes.len() as u64, state.config.max_file_size)?;

    let UploadedImage {
        filename, bytes, ..
    } = upload;
    let image = tokio::task::spawn_blocking(move || validate_image_content(&bytes))
        .await
        .map_err(|e| processing_failure(e.into()))??;

    let processed = process(&state, image).await?;

    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        duration_secs = elapsed,
        width = processed.width,
        height = processed.height,
        "completed"
    );
    Ok(png_response(processed, &filename, elapsed))
}

/// Rejects the request while the model session is cold.
///
/// A probe error lets the request through when `admission_fail_open` is set:
/// processing builds the session itself if it really is missing.
fn admit<F: SessionFactory>(state: &AppState<F>) -> Result<(), ApiError> {
    let model = state.model_id();
    match state.cache.readiness(model) {
        Ok(Readiness::Ready) => Ok(()),
        Ok(Readiness::NotReady) => {
            tracing::info!(model, "model not ready, rejecting request");
            match state.warmup.trigger_warm(model) {
                Ok(outcome) => tracing::debug!(?outcome, "warmup requested by rejected request"),
                Err(e) => tracing::warn!(error = %e, "could not trigger warmup"),
            }
            Err(ApiError::NotReady)
        }
        Err(e) if state.config.admission_fail_open => {
            tracing::warn!(error = %e, "readiness probe failed, admitting request");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(error = %e, "readiness probe failed, rejecting request");
            Err(ApiError::NotReady)
        }
    }
}

async fn read_upload(multipart: &mut Multipart, limit: u64) -> Result<UploadedImage, ApiError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let declared_name = field.file_name().map(str::to_string);
        let declared_type = field.content_type().map(str::to_string);
        tracing::info!(
            filename = declared_name.as_deref().unwrap_or("<none>"),
            content_type = declared_type.as_deref().unwrap_or("<none>"),
            "request received"
        );

        let filename = validate_filename(declared_name.as_deref())?.to_string();
        validate_content_type(declared_type.as_deref(), &filename)?;

        let mut bytes = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(e, limit))? {
            validate_file_size((bytes.len() + chunk.len()) as u64, limit)?;
            bytes.extend_from_slice(&chunk);
        }

        return Ok(UploadedImage {
            filename,
            content_type: declared_type,
            bytes,
        });
    }
    Err(ApiError::MissingFile)
}

fn multipart_error(err: MultipartError, limit: u64) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        // the body limit tripped before the field was fully read
        ApiError::InvalidInput(ValidationError::FileTooLarge {
            size: limit.saturating_add(1),
            limit,
        })
    } else {
        ApiError::Multipart(err.body_text())
    }
}

async fn process<F: SessionFactory>(
    state: &AppState<F>,
    image: image::DynamicImage,
) -> Result<ProcessedImage, ApiError> {
    let cache = Arc::clone(&state.cache);
    let model = state.model_id().to_string();
    let limit = state.config.inference_timeout();

    let work = tokio::task::spawn_blocking(move || {
        let session = cache.get_or_create(&model)?;
        ImageProcessor::process(&session, &image)
    });

    match tokio::time::timeout(limit, work).await {
        Ok(Ok(result)) => result.map_err(processing_failure),
        Ok(Err(join_error)) => Err(processing_failure(join_error.into())),
        // the blocking task cannot be cancelled; its result is dropped when it ends
        Err(_) => Err(processing_failure(BgRemovalError::Timeout {
            operation: "background removal".to_string(),
            limit,
        })),
    }
}

fn processing_failure(err: BgRemovalError) -> ApiError {
    tracing::error!(error = %err, source = ?std::error::Error::source(&err), "processing failed");
    ApiError::Processing(err)
}

/// `photo.jpg` becomes `removed_photo.png`. Characters that cannot appear in a
/// quoted header parameter are replaced.
pub fn derived_filename(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let sanitized: String = stem
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = if sanitized.trim().is_empty() {
        "image"
    } else {
        sanitized.as_str()
    };
    format!("removed_{stem}.png")
}

fn png_response(processed: ProcessedImage, filename: &str, elapsed_secs: f64) -> Response {
    let disposition =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", derived_filename(filename)))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"removed.png\""));
    let processing_time = HeaderValue::from_str(&format!("{elapsed_secs:.3}"))
        .unwrap_or_else(|_| HeaderValue::from_static("0"));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/png")),
            (header::CONTENT_DISPOSITION, disposition),
            (HeaderName::from_static(PROCESSING_TIME_HEADER), processing_time),
        ],
        processed.bytes,
    )
        .into_response()
}
