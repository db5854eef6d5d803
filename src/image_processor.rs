use std::io::Cursor;

use image::{
    codecs::png::{CompressionType, FilterType, PngEncoder},
    DynamicImage, GenericImageView,
};

use crate::errors::{BgRemovalError, Result};
use crate::session::Session;
use crate::traits::ImageSegmentationModel;

/// PNG-encoded RGBA result of one background removal.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub struct ImageProcessor;

impl ImageProcessor {
    /// Runs the segmentation and normalizes the result to an RGBA PNG.
    pub fn process<M: ImageSegmentationModel>(
        session: &Session<M>,
        image: &DynamicImage,
    ) -> Result<ProcessedImage> {
        tracing::info!(model = session.model_id(), "starting background removal");
        let segmented = session.segment(image)?;
        let rgba = ensure_alpha(segmented);
        let (width, height) = rgba.dimensions();
        let bytes = encode_png(&rgba)?;
        tracing::info!(width, height, bytes = bytes.len(), "background removal completed");
        Ok(ProcessedImage {
            bytes,
            width,
            height,
        })
    }
}

/// Returns RGBA8 input unchanged, converts anything else to RGBA8.
pub fn ensure_alpha(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageRgba8(_) => image,
        other => DynamicImage::ImageRgba8(other.to_rgba8()),
    }
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    let encoder =
        PngEncoder::new_with_quality(&mut buffer, CompressionType::Best, FilterType::Adaptive);
    image
        .write_with_encoder(encoder)
        .map_err(|e| BgRemovalError::image_processing("png encoding", e))?;
    Ok(buffer.into_inner())
}
