use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::errors::BgRemovalError;
use crate::validator::ValidationError;

/// Terminal failure states of a request, rendered as `{"detail": ...}`.
///
/// Server-side variants keep their source for logging but only ever show the
/// generic message to the client.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Model not ready. Please retry shortly.")]
    NotReady,

    #[error("No file uploaded")]
    MissingFile,

    #[error(transparent)]
    InvalidInput(#[from] ValidationError),

    #[error("Invalid multipart request: {0}")]
    Multipart(String),

    #[error("Upload timed out")]
    UploadTimeout,

    #[error("An unexpected error occurred")]
    Processing(#[source] BgRemovalError),

    #[error("Failed to start warming")]
    WarmupTrigger(#[source] BgRemovalError),
}

impl ApiError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::MissingFile | Self::Multipart(_) => StatusCode::BAD_REQUEST,
            Self::InvalidInput(err) => err.status_code(),
            Self::UploadTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::Processing(_) | Self::WarmupTrigger(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = vec![
            (ApiError::NotReady, StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::MissingFile, StatusCode::BAD_REQUEST),
            (ValidationError::EmptyFile.into(), StatusCode::BAD_REQUEST),
            (
                ValidationError::UnsupportedMediaType { content_type: None }.into(),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (
                ValidationError::FileTooLarge { size: 2, limit: 1 }.into(),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (ApiError::UploadTimeout, StatusCode::REQUEST_TIMEOUT),
            (
                ApiError::Processing(BgRemovalError::configuration("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.status_code(), expected, "{error:?}");
        }
    }

    #[test]
    fn test_processing_error_hides_detail() {
        let error = ApiError::Processing(BgRemovalError::configuration("secret path /opt/x"));
        assert_eq!(error.to_string(), "An unexpected error occurred");
    }
}
