//! Upload validation.
//!
//! Every check is a plain function so the gateway can run them in a fixed order and
//! stop at the first failure. Only [`validate_image_content`] does real work: it
//! decodes the payload and hands the decoded image on so it is never decoded twice.

use std::io::Cursor;
use std::path::Path;

use axum::http::StatusCode;
use image::{DynamicImage, ImageReader};
use thiserror::Error;

/// Accepted declared content types and the file extensions that imply them.
pub const ALLOWED_TYPES: &[(&str, &[&str])] = &[
    ("image/jpeg", &["jpg", "jpeg"]),
    ("image/png", &["png"]),
    ("image/webp", &["webp"]),
];

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Filename is required")]
    MissingFilename,

    #[error("Unsupported file type{}. Allowed: JPG, PNG, WEBP", describe_type(.content_type))]
    UnsupportedMediaType { content_type: Option<String> },

    #[error("Empty file uploaded")]
    EmptyFile,

    #[error("File size exceeds the maximum allowed size of {} MB.", format_megabytes(.limit))]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Invalid or corrupted image file")]
    CorruptImage { reason: String },
}

impl ValidationError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingFilename | Self::EmptyFile | Self::CorruptImage { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

fn describe_type(content_type: &Option<String>) -> String {
    match content_type.as_deref() {
        None => " (no content type declared and the file extension is not recognized)"
            .to_string(),
        Some(OCTET_STREAM) => {
            format!(" `{OCTET_STREAM}` (the file extension is not recognized)")
        }
        Some(t) => format!(" `{t}`"),
    }
}

fn format_megabytes(bytes: &u64) -> String {
    let mb = *bytes as f64 / 1024.0 / 1024.0;
    if mb.fract() == 0.0 {
        format!("{mb:.0}")
    } else {
        format!("{mb:.2}")
    }
}

pub fn validate_filename(filename: Option<&str>) -> Result<&str, ValidationError> {
    match filename.map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(ValidationError::MissingFilename),
    }
}

/// Checks the declared content type against [`ALLOWED_TYPES`].
///
/// Parameters such as `; charset=binary` are ignored. When the client sent no type,
/// or the generic `application/octet-stream`, the filename extension decides.
/// Returns the canonical content type on success.
pub fn validate_content_type(
    content_type: Option<&str>,
    filename: &str,
) -> Result<&'static str, ValidationError> {
    let declared = content_type
        .and_then(|t| t.split(';').next())
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty());

    match declared.as_deref() {
        Some(t) if t != OCTET_STREAM => ALLOWED_TYPES
            .iter()
            .find(|(allowed, _)| *allowed == t)
            .map(|(allowed, _)| *allowed)
            .ok_or_else(|| ValidationError::UnsupportedMediaType {
                content_type: declared.clone(),
            }),
        _ => content_type_from_extension(filename).ok_or_else(|| {
            ValidationError::UnsupportedMediaType {
                content_type: declared.clone(),
            }
        }),
    }
}

fn content_type_from_extension(filename: &str) -> Option<&'static str> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())?
        .to_lowercase();
    ALLOWED_TYPES
        .iter()
        .find(|(_, extensions)| extensions.contains(&extension.as_str()))
        .map(|(allowed, _)| *allowed)
}

pub fn validate_not_empty(bytes: &[u8]) -> Result<(), ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::EmptyFile);
    }
    Ok(())
}

pub fn validate_file_size(size: u64, limit: u64) -> Result<(), ValidationError> {
    if size > limit {
        tracing::warn!(size, limit, "upload exceeds maximum allowed size");
        return Err(ValidationError::FileTooLarge { size, limit });
    }
    Ok(())
}

/// Decodes the payload, guessing the format from its magic bytes.
///
/// A full decode is the structural check: truncated or corrupt data fails here
/// rather than halfway through inference.
pub fn validate_image_content(bytes: &[u8]) -> Result<DynamicImage, ValidationError> {
    let corrupt = |reason: String| {
        tracing::warn!(%reason, "invalid image");
        ValidationError::CorruptImage { reason }
    };

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| corrupt(e.to_string()))?;
    if reader.format().is_none() {
        return Err(corrupt("unrecognised image format".to_string()));
    }
    let image = reader.decode().map_err(|e| corrupt(e.to_string()))?;
    tracing::debug!(
        width = image.width(),
        height = image.height(),
        "image validation successful"
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([10, 200, 30])));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_filename_presence() {
        assert_eq!(validate_filename(Some("cat.png")), Ok("cat.png"));
        assert_eq!(
            validate_filename(Some("  ")),
            Err(ValidationError::MissingFilename)
        );
        assert_eq!(validate_filename(None), Err(ValidationError::MissingFilename));
    }

    #[test]
    fn test_content_type_allow_list() {
        let cases = vec![
            (Some("image/jpeg"), "a.jpg", Ok("image/jpeg")),
            (Some("image/PNG"), "a.png", Ok("image/png")),
            (Some("image/webp; q=1"), "a.webp", Ok("image/webp")),
            (None, "a.JPEG", Ok("image/jpeg")),
            (Some("application/octet-stream"), "a.png", Ok("image/png")),
        ];
        for (declared, filename, expected) in cases {
            assert_eq!(validate_content_type(declared, filename), expected);
        }
    }

    #[test]
    fn test_gif_is_rejected_even_with_png_extension() {
        let err = validate_content_type(Some("image/gif"), "a.png").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(err.to_string().contains("image/gif"));
    }

    #[test]
    fn test_missing_type_with_unknown_extension_is_rejected() {
        let err = validate_content_type(None, "notes.txt").unwrap_err();
        assert_eq!(err, ValidationError::UnsupportedMediaType { content_type: None });
        assert_eq!(
            err.to_string(),
            "Unsupported file type (no content type declared and the file extension \
             is not recognized). Allowed: JPG, PNG, WEBP"
        );

        let err = validate_content_type(Some("application/octet-stream"), "blob.bin").unwrap_err();
        assert!(err.to_string().contains("`application/octet-stream`"));
        assert!(err.to_string().contains("file extension is not recognized"));
    }

    #[test]
    fn test_empty_file() {
        assert_eq!(validate_not_empty(&[]), Err(ValidationError::EmptyFile));
        assert!(validate_not_empty(&[1]).is_ok());
    }

    #[test]
    fn test_size_ceiling_message_reflects_limit() {
        assert!(validate_file_size(10, 10).is_ok());

        let err = validate_file_size(11 * 1024 * 1024, 10 * 1024 * 1024).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            err.to_string(),
            "File size exceeds the maximum allowed size of 10 MB."
        );

        let err = validate_file_size(2_000_000, 1_500_000).unwrap_err();
        assert!(err.to_string().contains("1.43 MB"));
    }

    #[test]
    fn test_image_content_decodes_supported_formats() {
        for format in [ImageFormat::Png, ImageFormat::Jpeg] {
            let image = validate_image_content(&encoded(format)).unwrap();
            assert_eq!((image.width(), image.height()), (8, 6));
        }
    }

    #[test]
    fn test_corrupt_image_is_rejected() {
        let mut truncated = encoded(ImageFormat::Png);
        truncated.truncate(truncated.len() / 2);

        for bytes in [b"definitely not an image".to_vec(), truncated] {
            let err = validate_image_content(&bytes).unwrap_err();
            assert!(matches!(err, ValidationError::CorruptImage { .. }));
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        }
    }
}
