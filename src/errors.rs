use std::time::Duration;

use thiserror::Error;

use crate::validator::ValidationError;

/// Structured error types for the background removal service.
///
/// Each variant carries the context of its own domain (model runtime, image codec,
/// upload validation, background workers) so callers can branch on the variant
/// instead of parsing messages. The HTTP layer maps these onto status codes in
/// [`crate::server::ApiError`].
#[derive(Error, Debug)]
pub enum BgRemovalError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Image processing error: {operation} failed")]
    ImageProcessing {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Readiness probe for model `{model_id}` failed: {reason}")]
    ReadinessProbe { model_id: String, reason: String },

    #[error("Worker error: {operation} failed: {reason}")]
    Worker { operation: String, reason: String },

    #[error("{operation} timed out after {limit:?}")]
    Timeout { operation: String, limit: Duration },
}

pub type Result<T> = std::result::Result<T, BgRemovalError>;

impl BgRemovalError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn model(
        operation: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Model {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn image_processing(
        operation: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ImageProcessing {
            operation: operation.into(),
            source: source.into(),
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for BgRemovalError {
    fn from(err: ort::Error) -> Self {
        Self::model("ort operation", err)
    }
}

/// Convert image crate errors to image processing errors.
impl From<image::ImageError> for BgRemovalError {
    fn from(err: image::ImageError) -> Self {
        Self::image_processing("image processing", err)
    }
}

/// Convert ndarray shape errors to model errors.
///
/// Shape errors only occur while building or unpacking inference tensors, so they
/// belong to the model category rather than a separate tensor error type.
impl From<ndarray::ShapeError> for BgRemovalError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::model("tensor shape conversion", err)
    }
}

/// Convert I/O errors raised while encoding or loading files.
///
/// Code that knows the operation should construct the variant directly instead.
impl From<std::io::Error> for BgRemovalError {
    fn from(err: std::io::Error) -> Self {
        Self::image_processing("io", err)
    }
}

impl From<tokio::task::JoinError> for BgRemovalError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Worker {
            operation: "blocking task".to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_transparent() {
        let err: BgRemovalError = ValidationError::EmptyFile.into();
        assert_eq!(err.to_string(), "Empty file uploaded");
    }

    #[test]
    fn test_timeout_display_includes_limit() {
        let err = BgRemovalError::Timeout {
            operation: "inference".to_string(),
            limit: Duration::from_secs(3),
        };
        assert_eq!(err.to_string(), "inference timed out after 3s");
    }
}
