use crate::errors::Result;
use image::DynamicImage;
use ndarray::prelude::*;

/// Abstraction over the segmentation model.
///
/// The gateway and the session cache depend on this trait rather than on the ONNX
/// implementation, so tests can swap in a mock engine.
pub trait ImageSegmentationModel: Send + Sync {
    /// Removes the background, returning an image whose alpha channel is the mask.
    fn segment_image(&self, img: &DynamicImage) -> Result<DynamicImage>;

    /// Side length of the square model input.
    fn get_image_size(&self) -> u32;

    /// Raw tensor prediction (low-level API).
    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>>;
}

/// Builds segmentation engines by model identifier.
///
/// Construction is expected to be slow (weights loading, execution provider
/// discovery) and is only ever invoked through [`crate::session::SessionCache`].
pub trait SessionFactory: Send + Sync + 'static {
    type Model: ImageSegmentationModel + 'static;

    fn create(&self, model_id: &str) -> Result<Self::Model>;
}
