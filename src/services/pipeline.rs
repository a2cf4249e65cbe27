//! Per-job-type image preparation and detection assembly.

use image::RgbImage;
use std::sync::Arc;

use crate::models::job::JobType;
use crate::models::recognition::{Detection, ModelInput};
use crate::models::task::RecognitionResult;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.9;

/// Per-channel `(x / 255 - mean) / std` normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    /// Plain 0..1 scaling.
    pub const UNIT_SCALE: Normalization = Normalization {
        mean: [0.0, 0.0, 0.0],
        std: [1.0, 1.0, 1.0],
    };

    pub const IMAGENET: Normalization = Normalization {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };
}

/// Preprocessing and postprocessing hooks for one CAPTCHA family. The
/// consume loop only talks to this interface.
pub trait CaptchaPipeline: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Turn an encoded image into recognizer input.
    fn preprocess(&self, image: &[u8]) -> Result<ModelInput, PreprocessError>;

    /// Turn raw detections into recognized text.
    fn postprocess(&self, detections: Vec<Detection>) -> RecognitionResult;
}

/// Decode an image, check its size, and keep the first three channels.
pub fn decode_rgb(bytes: &[u8], expected: (u32, u32)) -> Result<RgbImage, PreprocessError> {
    let image = image::load_from_memory(bytes)?;
    let actual = (image.height(), image.width());
    if actual != expected {
        return Err(PreprocessError::UnexpectedShape { expected, actual });
    }
    Ok(image.to_rgb8())
}

/// Convert an RGB image into a normalized CHW tensor.
pub fn image_to_chw(image: &RgbImage, norm: &Normalization) -> ModelInput {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let plane = width * height;
    let mut data = vec![0.0f32; 3 * plane];

    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (pixel[c] as f32 / 255.0 - norm.mean[c]) / norm.std[c];
        }
    }

    ModelInput {
        shape: [3, height, width],
        data,
    }
}

/// Keep detections scoring above `threshold`, read them left to right, and
/// multiply their scores.
///
/// With nothing left the result is the empty string at confidence 1.0.
pub fn assemble(mut detections: Vec<Detection>, threshold: f64) -> RecognitionResult {
    detections.retain(|d| d.score > threshold);
    detections.sort_by(|a, b| a.bbox.x_min.total_cmp(&b.bbox.x_min));

    RecognitionResult {
        text: detections.iter().map(|d| d.label.as_str()).collect(),
        confidence: detections.iter().map(|d| d.score).product(),
    }
}

/// Tax service captchas: 100x200, scaled to 0..1.
#[derive(Debug, Clone)]
pub struct FnsPipeline {
    threshold: f64,
}

impl FnsPipeline {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Default for FnsPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl CaptchaPipeline for FnsPipeline {
    fn job_type(&self) -> JobType {
        JobType::Fns
    }

    fn preprocess(&self, image: &[u8]) -> Result<ModelInput, PreprocessError> {
        let rgb = decode_rgb(image, JobType::Fns.image_dimensions())?;
        Ok(image_to_chw(&rgb, &Normalization::UNIT_SCALE))
    }

    fn postprocess(&self, detections: Vec<Detection>) -> RecognitionResult {
        assemble(detections, self.threshold)
    }
}

/// Alcohol declaration captchas: 80x160, ImageNet-normalized.
#[derive(Debug, Clone)]
pub struct AlcoPipeline {
    threshold: f64,
}

impl AlcoPipeline {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Default for AlcoPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl CaptchaPipeline for AlcoPipeline {
    fn job_type(&self) -> JobType {
        JobType::Alco
    }

    fn preprocess(&self, image: &[u8]) -> Result<ModelInput, PreprocessError> {
        let rgb = decode_rgb(image, JobType::Alco.image_dimensions())?;
        Ok(image_to_chw(&rgb, &Normalization::IMAGENET))
    }

    fn postprocess(&self, detections: Vec<Detection>) -> RecognitionResult {
        assemble(detections, self.threshold)
    }
}

pub fn pipeline_for(job_type: JobType, threshold: f64) -> Arc<dyn CaptchaPipeline> {
    match job_type {
        JobType::Fns => Arc::new(FnsPipeline::new(threshold)),
        JobType::Alco => Arc::new(AlcoPipeline::new(threshold)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Image decoding failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Unexpected image size: expected {expected:?} (HxW), got {actual:?}")]
    UnexpectedShape {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}
