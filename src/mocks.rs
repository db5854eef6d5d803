use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{BgRemovalError, Result};
use crate::traits::{ImageSegmentationModel, SessionFactory};
use image::DynamicImage;
use ndarray::prelude::*;

/// Mock segmentation model for tests.
///
/// Returns the input as RGBA with the left half made transparent, and counts how
/// often it was asked to segment.
#[derive(Debug, Clone)]
pub struct MockSegmentationModel {
    pub image_size: u32,
    calls: Arc<AtomicUsize>,
    fail: bool,
    delay: Duration,
}

impl MockSegmentationModel {
    pub fn new(image_size: u32) -> Self {
        Self {
            image_size,
            calls: Arc::new(AtomicUsize::new(0)),
            fail: false,
            delay: Duration::ZERO,
        }
    }

    pub fn failing(image_size: u32) -> Self {
        Self {
            fail: true,
            ..Self::new(image_size)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageSegmentationModel for MockSegmentationModel {
    fn segment_image(&self, img: &DynamicImage) -> Result<DynamicImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail {
            return Err(BgRemovalError::model(
                "mock segmentation",
                "segmentation failure requested by test",
            ));
        }

        let mut rgba = img.to_rgba8();
        let half = rgba.width() / 2;
        for (x, _, pixel) in rgba.enumerate_pixels_mut() {
            if x < half {
                pixel[3] = 0;
            }
        }
        Ok(DynamicImage::ImageRgba8(rgba))
    }

    fn get_image_size(&self) -> u32 {
        self.image_size
    }

    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let shape = tensor.shape();
        Ok(Array4::<f32>::zeros((shape[0], 1, shape[2], shape[3])))
    }
}

/// Session factory for tests that counts constructions and can be told to be slow
/// or to fail.
#[derive(Debug)]
pub struct MockSessionFactory {
    constructions: AtomicUsize,
    failures_remaining: AtomicUsize,
    delay: Duration,
    segment_delay: Duration,
    segment_calls: Arc<AtomicUsize>,
    fail_segmentation: bool,
}

impl Default for MockSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self {
            constructions: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            delay: Duration::ZERO,
            segment_delay: Duration::ZERO,
            segment_calls: Arc::new(AtomicUsize::new(0)),
            fail_segmentation: false,
        }
    }

    /// Sleep this long inside every construction.
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sleep this long inside every segmentation run by the built models.
    pub const fn with_segment_delay(mut self, delay: Duration) -> Self {
        self.segment_delay = delay;
        self
    }

    /// Fail the first `count` constructions.
    pub fn failing_first(self, count: usize) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Build models whose segmentation always fails.
    pub const fn failing_segmentation(mut self) -> Self {
        self.fail_segmentation = true;
        self
    }

    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    /// Segmentations run by every model this factory has built.
    pub fn segment_calls(&self) -> usize {
        self.segment_calls.load(Ordering::SeqCst)
    }
}

impl SessionFactory for MockSessionFactory {
    type Model = MockSegmentationModel;

    fn create(&self, _model_id: &str) -> Result<MockSegmentationModel> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.constructions.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BgRemovalError::model(
                "mock session construction",
                "construction failure requested by test",
            ));
        }

        Ok(MockSegmentationModel {
            image_size: 320,
            calls: Arc::clone(&self.segment_calls),
            fail: self.fail_segmentation,
            delay: self.segment_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};

    #[test]
    fn test_mock_model_segment_image() -> Result<()> {
        let mock = MockSegmentationModel::new(320);
        let test_image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, Rgb([255, 0, 0])));

        let result = mock.segment_image(&test_image)?;
        assert_eq!(result.dimensions(), test_image.dimensions());
        assert_eq!(result.to_rgba8().get_pixel(0, 0)[3], 0);
        assert_eq!(result.to_rgba8().get_pixel(3, 0)[3], 255);
        assert_eq!(mock.calls(), 1);
        Ok(())
    }

    #[test]
    fn test_mock_model_predict() -> Result<()> {
        let mock = MockSegmentationModel::new(320);
        let input_tensor = Array4::<f32>::zeros((1, 3, 320, 320));

        let result = mock.predict(input_tensor.view())?;
        assert_eq!(result.shape(), &[1, 1, 320, 320]);
        Ok(())
    }

    #[test]
    fn test_factory_fails_requested_number_of_times() {
        let factory = MockSessionFactory::new().failing_first(2);
        assert!(factory.create("u2net").is_err());
        assert!(factory.create("u2net").is_err());
        assert!(factory.create("u2net").is_ok());
        assert_eq!(factory.constructions(), 3);
    }

    #[test]
    fn test_segment_delay_is_applied() -> Result<()> {
        let factory = MockSessionFactory::new().with_segment_delay(Duration::from_millis(50));
        let model = factory.create("u2net")?;

        let started = std::time::Instant::now();
        model.segment_image(&DynamicImage::new_rgb8(2, 2))?;
        assert!(started.elapsed() >= Duration::from_millis(50));
        Ok(())
    }

    #[test]
    fn test_factory_models_share_call_counter() -> Result<()> {
        let factory = MockSessionFactory::new();
        let a = factory.create("u2net")?;
        let b = factory.create("u2net")?;
        let img = DynamicImage::new_rgb8(2, 2);

        a.segment_image(&img)?;
        b.segment_image(&img)?;
        assert_eq!(factory.segment_calls(), 2);
        Ok(())
    }
}
