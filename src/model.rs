use std::path::{Path, PathBuf};

use crate::{
    errors::{BgRemovalError, Result},
    traits::{ImageSegmentationModel, SessionFactory},
};
use image::{imageops, imageops::FilterType, DynamicImage, GenericImageView, ImageBuffer, Luma};
use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;

/// Input side length used when the model declares a dynamic spatial dimension.
pub const DEFAULT_IMAGE_SIZE: u32 = 320;

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

pub struct Model {
    pub image_size: u32,
    input_name: String,
    output_name: String,
    session: Mutex<Session>,
}

impl Model {
    pub fn new(model_path: &Path, num_threads: usize, device_id: i32) -> Result<Self> {
        if !model_path.is_file() {
            return Err(BgRemovalError::model(
                format!("model file lookup: {}", model_path.display()),
                std::io::Error::new(std::io::ErrorKind::NotFound, "model file does not exist"),
            ));
        }

        let mut session = SessionBuilder::new()
            .map_err(|e| BgRemovalError::model("session builder initialization", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| BgRemovalError::model("execution provider registration", e))?
            .with_intra_threads(num_threads)
            .map_err(|e| BgRemovalError::model("intra-op thread configuration", e))?
            .with_memory_pattern(true)
            .map_err(|e| BgRemovalError::model("memory pattern configuration", e))?
            .commit_from_file(model_path)
            .map_err(|e| {
                BgRemovalError::model(format!("model file load: {}", model_path.display()), e)
            })?;

        let input = session.inputs.first().ok_or_else(|| {
            BgRemovalError::model("model input lookup", "model declares no inputs")
        })?;
        let input_name = input.name.clone();
        let image_size = input
            .input_type
            .tensor_shape()
            .and_then(|shape| shape.get(2).copied())
            .filter(|dim| *dim > 0)
            .map_or(DEFAULT_IMAGE_SIZE, |dim| dim as u32);
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| {
                BgRemovalError::model("model output lookup", "model declares no outputs")
            })?;

        // run once so the first real request does not pay for runtime initialization
        let data = Array4::<f32>::zeros((1, 3, image_size as usize, image_size as usize));
        session
            .run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&data)
                .map_err(|e| BgRemovalError::model("warmup tensor creation", e))?])
            .map_err(|e| BgRemovalError::model("warmup inference", e))?;

        Ok(Self {
            image_size,
            input_name,
            output_name,
            session: Mutex::new(session),
        })
    }
}

impl ImageSegmentationModel for Model {
    fn segment_image(&self, img: &DynamicImage) -> Result<DynamicImage> {
        let tensor = preprocess(img, self.image_size);
        let prediction = self.predict(tensor.view())?;
        let (width, height) = img.dimensions();
        let mask = postprocess_mask(prediction.view(), width, height)?;
        apply_mask_to_image(img, &mask)
    }

    fn get_image_size(&self) -> u32 {
        self.image_size
    }

    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?
        ])?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}

/// Resizes to the model's square input and applies U2-Net normalization: scale by
/// the image maximum, then per-channel ImageNet mean/std, laid out as NCHW.
pub fn preprocess(img: &DynamicImage, image_size: u32) -> Array4<f32> {
    let resized = imageops::resize(&img.to_rgb8(), image_size, image_size, FilterType::Lanczos3);
    let max = resized
        .as_raw()
        .iter()
        .copied()
        .max()
        .map_or(1e-6, |m| f32::from(m).max(1e-6));

    let size = image_size as usize;
    Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
        let value = f32::from(resized.get_pixel(x as u32, y as u32)[c]) / max;
        (value - MEAN[c]) / STD[c]
    })
}

/// Takes channel 0 of the prediction, min-max normalizes it and resizes it back to
/// the original image dimensions.
pub fn postprocess_mask(
    prediction: ArrayView4<f32>,
    width: u32,
    height: u32,
) -> Result<ImageBuffer<Luma<f32>, Vec<f32>>> {
    let &[_, _, mask_h, mask_w] = prediction.shape() else {
        return Err(BgRemovalError::model(
            "mask extraction",
            format!("unexpected prediction shape {:?}", prediction.shape()),
        ));
    };
    let channel = prediction.slice(s![0, 0, .., ..]);

    let (min, max) = channel
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = max - min;
    let normalized: Vec<f32> = channel
        .iter()
        .map(|v| if range > f32::EPSILON { (v - min) / range } else { 0.0 })
        .collect();

    let mask = ImageBuffer::from_raw(mask_w as u32, mask_h as u32, normalized).ok_or_else(|| {
        BgRemovalError::model("mask extraction", "prediction buffer does not match its shape")
    })?;
    Ok(imageops::resize(&mask, width, height, FilterType::Lanczos3))
}

pub fn apply_mask_to_image(
    img: &DynamicImage,
    mask: &ImageBuffer<Luma<f32>, Vec<f32>>,
) -> Result<DynamicImage> {
    let mut rgba_img = img.to_rgba8();
    if rgba_img.dimensions() != mask.dimensions() {
        let (iw, ih) = rgba_img.dimensions();
        let (mw, mh) = mask.dimensions();
        return Err(BgRemovalError::image_processing(
            "mask application",
            format!("image and mask sizes differ: image {iw}x{ih}, mask {mw}x{mh}"),
        ));
    }

    for (pixel, Luma([alpha])) in rgba_img.pixels_mut().zip(mask.pixels()) {
        pixel[3] = (alpha.clamp(0.0, 1.0) * 255.0).round() as u8;
    }
    Ok(DynamicImage::ImageRgba8(rgba_img))
}

/// Loads `<model_dir>/<model_id>.onnx` with the configured runtime options.
#[derive(Debug, Clone)]
pub struct OnnxSessionFactory {
    pub model_dir: PathBuf,
    pub num_threads: usize,
    pub device_id: i32,
}

impl OnnxSessionFactory {
    pub fn model_path(&self, model_id: &str) -> PathBuf {
        self.model_dir.join(format!("{model_id}.onnx"))
    }
}

impl SessionFactory for OnnxSessionFactory {
    type Model = Model;

    fn create(&self, model_id: &str) -> Result<Model> {
        Model::new(&self.model_path(model_id), self.num_threads, self.device_id)
    }
}
