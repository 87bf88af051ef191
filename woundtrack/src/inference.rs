// Boundary with the external segmentation and tissue classification models.
// The core only relies on the output shapes defined here; any model can sit behind the traits.

use image::{GrayImage, RgbImage};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use woundtrack_common::TissueKind;

/// Failures reported by an inference backend. Passed through to the caller, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("segmentation service unavailable: {0}")]
    SegmentationUnavailable(String),

    #[error("classification service unavailable: {0}")]
    ClassificationUnavailable(String),
}

/// Per-pixel wound probability, indexed `[row, column]`
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    probabilities: Array2<f32>,
}

impl SegmentationMask {
    pub fn from_probabilities(probabilities: Array2<f32>) -> Self {
        Self { probabilities }
    }

    /// Binary mask from a predicate over pixel coordinates
    pub fn from_fn(width: u32, height: u32, is_wound: impl Fn(u32, u32) -> bool) -> Self {
        let probabilities = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            if is_wound(x as u32, y as u32) {
                1.0
            } else {
                0.0
            }
        });
        Self { probabilities }
    }

    /// Grayscale mask image where 255 means certain wound
    pub fn from_gray_image(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let probabilities = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            image.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
        });
        Self { probabilities }
    }

    pub fn width(&self) -> u32 {
        self.probabilities.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.probabilities.nrows() as u32
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn probability(&self, x: u32, y: u32) -> f32 {
        self.probabilities[[y as usize, x as usize]]
    }

    pub fn is_wound(&self, x: u32, y: u32, threshold: f32) -> bool {
        self.probability(x, y) > threshold
    }

    pub fn wound_pixel_count(&self, threshold: f32) -> u64 {
        self.probabilities.iter().filter(|&&p| p > threshold).count() as u64
    }
}

/// Pixels the classifier assigned to one tissue kind
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedRegion {
    pub kind: TissueKind,
    pub confidence: f32,
    /// (x, y) pixel coordinates
    pub pixels: Vec<(u32, u32)>,
}

/// Tissue labels for one image
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub width: u32,
    pub height: u32,
    pub regions: Vec<ClassifiedRegion>,
}

impl Classification {
    pub fn new(width: u32, height: u32, regions: Vec<ClassifiedRegion>) -> Self {
        Self {
            width,
            height,
            regions,
        }
    }

    /// One full-confidence region per tissue code found in a grayscale label map.
    /// Pixels with unknown codes are left unlabelled.
    pub fn from_label_map(labels: &GrayImage) -> Self {
        let mut regions: Vec<ClassifiedRegion> = Vec::new();
        for (x, y, code) in labels.enumerate_pixels() {
            let Some(kind) = TissueKind::from_label_code(code[0]) else {
                continue;
            };
            match regions.iter_mut().find(|r| r.kind == kind) {
                Some(region) => region.pixels.push((x, y)),
                None => regions.push(ClassifiedRegion {
                    kind,
                    confidence: 1.0,
                    pixels: vec![(x, y)],
                }),
            }
        }
        Self::new(labels.width(), labels.height(), regions)
    }
}

/// Wound boundary segmentation capability
pub trait Segmenter: Send + Sync {
    fn segment(&self, image: &RgbImage) -> Result<SegmentationMask, ServiceError>;
}

/// Tissue classification capability
pub trait TissueClassifier: Send + Sync {
    fn classify(
        &self,
        image: &RgbImage,
        mask: &SegmentationMask,
    ) -> Result<Classification, ServiceError>;
}

/// Segmenter that serves a mask image produced ahead of time by an offline model run
#[derive(Debug, Clone)]
pub struct MaskImageSegmenter {
    path: PathBuf,
}

impl MaskImageSegmenter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Segmenter for MaskImageSegmenter {
    fn segment(&self, image: &RgbImage) -> Result<SegmentationMask, ServiceError> {
        let mask = load_gray(&self.path).map_err(ServiceError::SegmentationUnavailable)?;
        if mask.dimensions() != image.dimensions() {
            return Err(ServiceError::SegmentationUnavailable(format!(
                "mask {}x{} does not match image {}x{}",
                mask.width(),
                mask.height(),
                image.width(),
                image.height()
            )));
        }
        debug!("Loaded segmentation mask from {}", self.path.display());
        Ok(SegmentationMask::from_gray_image(&mask))
    }
}

/// Classifier that serves a grayscale label map of tissue codes
#[derive(Debug, Clone)]
pub struct LabelMapClassifier {
    path: PathBuf,
}

impl LabelMapClassifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TissueClassifier for LabelMapClassifier {
    fn classify(
        &self,
        _image: &RgbImage,
        _mask: &SegmentationMask,
    ) -> Result<Classification, ServiceError> {
        let labels = load_gray(&self.path).map_err(ServiceError::ClassificationUnavailable)?;
        debug!("Loaded tissue label map from {}", self.path.display());
        Ok(Classification::from_label_map(&labels))
    }
}

fn load_gray(path: &Path) -> Result<GrayImage, String> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|e| format!("{}: {}", path.display(), e))
}
