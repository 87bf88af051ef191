// Calibration patch detection
// Finds the 1 cm² green reference patch and derives the pixel-to-cm² scale

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::geometry::convex_hull;
use imageproc::point::Point;
use imageproc::rect::Rect;
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};
use woundtrack_common::{CalibrationResult, PixelBounds};

use crate::config::CalibrationConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("no calibration patch found in the image")]
    PatchNotFound,

    #[error("calibration patch too small: {pixel_area} px, need at least {min_pixels} px")]
    PatchTooSmall { pixel_area: u64, min_pixels: u64 },

    #[error("{candidates} calibration patch candidates of near-identical size")]
    AmbiguousPatch { candidates: usize },
}

impl CalibrationError {
    /// Stable reason code for callers and reports
    pub fn reason(&self) -> &'static str {
        match self {
            CalibrationError::PatchNotFound | CalibrationError::PatchTooSmall { .. } => {
                "patch_not_found"
            }
            CalibrationError::AmbiguousPatch { .. } => "ambiguous_patch",
        }
    }
}

/// Per-region pixel statistics gathered in a single pass over the label image
#[derive(Debug, Clone)]
struct RegionStats {
    area: u64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    /// Leftmost and rightmost pixel per row
    row_spans: BTreeMap<u32, (u32, u32)>,
}

impl RegionStats {
    fn new(x: u32, y: u32) -> Self {
        Self {
            area: 0,
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            row_spans: BTreeMap::new(),
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.area += 1;
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
        self.row_spans
            .entry(y)
            .and_modify(|(lo, hi)| {
                *lo = (*lo).min(x);
                *hi = (*hi).max(x);
            })
            .or_insert((x, x));
    }

    fn bounds(&self) -> PixelBounds {
        PixelBounds {
            x: self.min_x,
            y: self.min_y,
            width: self.max_x - self.min_x + 1,
            height: self.max_y - self.min_y + 1,
        }
    }

    /// Region area over the area of its convex hull.
    /// The hull is built from pixel corners so a filled rectangle scores exactly 1.
    fn solidity(&self) -> f64 {
        let mut corners = Vec::with_capacity(self.row_spans.len() * 4);
        for (&y, &(lo, hi)) in &self.row_spans {
            let (y, lo, hi) = (y as i32, lo as i32, hi as i32);
            corners.push(Point::new(lo, y));
            corners.push(Point::new(hi + 1, y));
            corners.push(Point::new(lo, y + 1));
            corners.push(Point::new(hi + 1, y + 1));
        }

        let hull = convex_hull(corners.as_slice());
        let hull_area = polygon_area(&hull);
        if hull_area <= 0.0 {
            return 0.0;
        }
        (self.area as f64 / hull_area).min(1.0)
    }
}

/// A green region that passed the size and shape filters
#[derive(Debug, Clone, Copy)]
struct PatchCandidate {
    area: u64,
    solidity: f64,
    bounds: PixelBounds,
}

/// Detect the calibration patch and derive the pixel scale
pub fn calibrate(
    image: &RgbImage,
    config: &CalibrationConfig,
) -> Result<CalibrationResult, CalibrationError> {
    let (width, height) = image.dimensions();
    let total_pixels = width as u64 * height as u64;
    if total_pixels == 0 {
        return Err(CalibrationError::PatchNotFound);
    }

    let green = green_mask(image, config);
    let labels = connected_components(&green, Connectivity::Eight, Luma([0u8]));

    let mut regions: BTreeMap<u32, RegionStats> = BTreeMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        regions
            .entry(label)
            .or_insert_with(|| RegionStats::new(x, y))
            .add(x, y);
    }

    debug!("Found {} green region(s) in {}x{} image", regions.len(), width, height);

    let largest_green = regions.values().map(|r| r.area).max().unwrap_or(0);
    let mut candidates: Vec<PatchCandidate> = Vec::new();

    for (label, region) in &regions {
        if region.area < config.min_patch_pixels {
            debug!("  Region {}: area {} px below minimum, rejected", label, region.area);
            continue;
        }
        let solidity = region.solidity();
        if solidity < config.min_solidity {
            debug!(
                "  Region {}: area {} px, solidity {:.3} below {:.3}, rejected",
                label, region.area, solidity, config.min_solidity
            );
            continue;
        }
        debug!("  Region {}: area {} px, solidity {:.3}, candidate", label, region.area, solidity);
        candidates.push(PatchCandidate {
            area: region.area,
            solidity,
            bounds: region.bounds(),
        });
    }

    if candidates.is_empty() {
        if largest_green > 0 && largest_green < config.min_patch_pixels {
            return Err(CalibrationError::PatchTooSmall {
                pixel_area: largest_green,
                min_pixels: config.min_patch_pixels,
            });
        }
        return Err(CalibrationError::PatchNotFound);
    }

    candidates.sort_by(|a, b| b.area.cmp(&a.area));
    let best = candidates[0];

    let tied = candidates
        .iter()
        .filter(|c| {
            (best.area - c.area) as f64 / best.area as f64 <= config.ambiguity_tolerance
        })
        .count();
    if tied > 1 {
        return Err(CalibrationError::AmbiguousPatch { candidates: tied });
    }

    let area_fraction = best.area as f64 / total_pixels as f64;
    let patch_confidence =
        (best.solidity * size_score(area_fraction, config)).clamp(0.0, 1.0);

    let result = CalibrationResult {
        scale_cm2_per_px: 1.0 / best.area as f64,
        patch_confidence,
        patch_pixel_area: best.area,
        patch_solidity: best.solidity,
        patch_bounds: best.bounds,
    };

    info!(
        "Calibration patch: {} px at ({}, {}), solidity {:.3}, confidence {:.2}",
        best.area, best.bounds.x, best.bounds.y, best.solidity, patch_confidence
    );

    Ok(result)
}

/// Binary mask of pixels inside the calibration green HSV band
fn green_mask(image: &RgbImage, config: &CalibrationConfig) -> GrayImage {
    let mut mask = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let (hue, saturation, value) = rgb_to_hsv(pixel);
        let is_green = hue >= config.hue_min_deg
            && hue <= config.hue_max_deg
            && saturation >= config.min_saturation
            && value >= config.min_value;
        if is_green {
            mask.put_pixel(x, y, Luma([255u8]));
        }
    }
    mask
}

/// Convert an RGB pixel to (hue in degrees, saturation, value)
pub fn rgb_to_hsv(pixel: &Rgb<u8>) -> (f64, f64, f64) {
    let r = pixel[0] as f64 / 255.0;
    let g = pixel[1] as f64 / 255.0;
    let b = pixel[2] as f64 / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };

    let saturation = if max == 0.0 { 0.0 } else { delta / max };

    (hue, saturation, max)
}

/// Score the patch size relative to the frame.
/// Full marks inside the ideal band, falling off for patches that are tiny (far away)
/// or huge (held against the lens).
fn size_score(area_fraction: f64, config: &CalibrationConfig) -> f64 {
    if area_fraction < config.ideal_area_fraction_min {
        area_fraction / config.ideal_area_fraction_min
    } else if area_fraction <= config.ideal_area_fraction_max {
        1.0
    } else {
        ((1.0 - area_fraction) / (1.0 - config.ideal_area_fraction_max)).max(0.0)
    }
}

/// Area of a polygon using the shoelace formula
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }

    let n = points.len();
    let mut twice_area: i64 = 0;
    for i in 0..n {
        let j = (i + 1) % n;
        twice_area += points[i].x as i64 * points[j].y as i64;
        twice_area -= points[j].x as i64 * points[i].y as i64;
    }

    (twice_area as f64 / 2.0).abs()
}

/// Copy of the photo with the detected patch outlined, for debugging
pub fn draw_patch_overlay(image: &RgbImage, calibration: &CalibrationResult) -> RgbImage {
    let mut annotated = image.clone();
    let bounds = calibration.patch_bounds;
    let outline = Rgb([255u8, 0u8, 255u8]);

    // Two nested outlines so the box survives JPEG compression
    draw_hollow_rect_mut(
        &mut annotated,
        Rect::at(bounds.x as i32, bounds.y as i32).of_size(bounds.width, bounds.height),
        outline,
    );
    if bounds.x > 0 && bounds.y > 0 {
        draw_hollow_rect_mut(
            &mut annotated,
            Rect::at(bounds.x as i32 - 1, bounds.y as i32 - 1)
                .of_size(bounds.width + 2, bounds.height + 2),
            outline,
        );
    }

    annotated
}
