// Measurement aggregation
// Turns a calibrated scale, a wound mask and tissue labels into one Measurement

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use woundtrack_common::{CalibrationResult, Measurement, TissueKind, WoundId};

use crate::config::AggregationConfig;
use crate::inference::{Classification, SegmentationMask};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("segmentation mask contains no wound pixels")]
    EmptyMask,

    #[error("tissue classification does not overlap the wound mask")]
    NoOverlap,

    #[error("mask is {mask_width}x{mask_height} but classification is {class_width}x{class_height}")]
    DimensionMismatch {
        mask_width: u32,
        mask_height: u32,
        class_width: u32,
        class_height: u32,
    },
}

impl AggregationError {
    pub fn reason(&self) -> &'static str {
        match self {
            AggregationError::EmptyMask => "empty_mask",
            AggregationError::NoOverlap => "no_overlap",
            AggregationError::DimensionMismatch { .. } => "dimension_mismatch",
        }
    }
}

/// Who, when and which risk tier a scan belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct ScanContext {
    pub wound_id: WoundId,
    pub timestamp: DateTime<Utc>,
    pub patient_is_diabetic: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MeasurementAggregator {
    config: AggregationConfig,
}

impl MeasurementAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    /// Combine the stage outputs for one image into a Measurement.
    ///
    /// `redness_raw` and `pus_raw` come from an external collaborator; they are only
    /// range-checked here.
    pub fn aggregate(
        &self,
        calibration: &CalibrationResult,
        mask: &SegmentationMask,
        classification: &Classification,
        redness_raw: f64,
        pus_raw: f64,
        context: &ScanContext,
    ) -> Result<Measurement, AggregationError> {
        let (width, height) = mask.dimensions();
        if (classification.width, classification.height) != (width, height) {
            return Err(AggregationError::DimensionMismatch {
                mask_width: width,
                mask_height: height,
                class_width: classification.width,
                class_height: classification.height,
            });
        }

        let threshold = self.config.mask_threshold;
        let wound_pixels = mask.wound_pixel_count(threshold);
        if wound_pixels == 0 {
            return Err(AggregationError::EmptyMask);
        }

        let tissue_counts = count_tissue_in_mask(mask, classification, threshold);
        let classified_pixels: u64 = tissue_counts.values().sum();
        if classified_pixels == 0 {
            return Err(AggregationError::NoOverlap);
        }

        if classified_pixels < wound_pixels {
            debug!(
                "Classifier covered {} of {} wound pixels, renormalising fractions",
                classified_pixels, wound_pixels
            );
        }

        let tissue_fractions: BTreeMap<TissueKind, f64> = tissue_counts
            .into_iter()
            .map(|(kind, count)| (kind, count as f64 / classified_pixels as f64))
            .collect();

        let area_cm2 = calibration.pixels_to_cm2(wound_pixels);

        info!(
            "Wound {}: {} px = {:.3} cm², {} tissue kind(s)",
            context.wound_id,
            wound_pixels,
            area_cm2,
            tissue_fractions.len()
        );

        Ok(Measurement {
            wound_id: context.wound_id.clone(),
            timestamp: context.timestamp,
            area_cm2,
            tissue_fractions,
            redness_score: clamp_score("redness", redness_raw),
            pus_score: clamp_score("pus", pus_raw),
            patient_is_diabetic: context.patient_is_diabetic,
        })
    }
}

const UNCLAIMED: u32 = u32::MAX;

/// Pixels per tissue kind, restricted to the wound mask.
/// A pixel claimed by several regions goes to the most confident one.
fn count_tissue_in_mask(
    mask: &SegmentationMask,
    classification: &Classification,
    threshold: f32,
) -> BTreeMap<TissueKind, u64> {
    let (width, height) = mask.dimensions();
    // One u32 region index per pixel, UNCLAIMED where no region covers it
    let mut owner: Vec<u32> = vec![UNCLAIMED; width as usize * height as usize];
    let mut out_of_bounds = 0usize;

    let regions = classification.regions.iter().take(UNCLAIMED as usize);
    for (region_idx, region) in (0u32..).zip(regions) {
        for &(x, y) in &region.pixels {
            if x >= width || y >= height {
                out_of_bounds += 1;
                continue;
            }
            if !mask.is_wound(x, y, threshold) {
                continue;
            }
            let slot = &mut owner[y as usize * width as usize + x as usize];
            if *slot == UNCLAIMED
                || classification.regions[*slot as usize].confidence < region.confidence
            {
                *slot = region_idx;
            }
        }
    }

    if out_of_bounds > 0 {
        warn!("Ignored {} classified pixel(s) outside the image", out_of_bounds);
    }

    let mut counts = BTreeMap::new();
    for region_idx in owner.into_iter().filter(|&idx| idx != UNCLAIMED) {
        *counts.entry(classification.regions[region_idx as usize].kind).or_insert(0u64) += 1;
    }
    counts
}

/// Clamp an externally derived score into [0, 1]
fn clamp_score(name: &str, raw: f64) -> f64 {
    if !raw.is_finite() {
        warn!("Non-finite {} score {}, using 0", name, raw);
        return 0.0;
    }
    if !(0.0..=1.0).contains(&raw) {
        warn!("{} score {} outside [0, 1], clamping", name, raw);
    }
    raw.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ClassifiedRegion;
    use chrono::TimeZone;
    use woundtrack_common::PixelBounds;

    fn calibration(patch_pixels: u64) -> CalibrationResult {
        CalibrationResult {
            scale_cm2_per_px: 1.0 / patch_pixels as f64,
            patch_confidence: 1.0,
            patch_pixel_area: patch_pixels,
            patch_solidity: 1.0,
            patch_bounds: PixelBounds { x: 0, y: 0, width: 1, height: 1 },
        }
    }

    fn context() -> ScanContext {
        ScanContext {
            wound_id: WoundId::from("w1"),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            patient_is_diabetic: true,
        }
    }

    fn region(kind: TissueKind, confidence: f32, pixels: Vec<(u32, u32)>) -> ClassifiedRegion {
        ClassifiedRegion { kind, confidence, pixels }
    }

    fn all_pixels(width: u32, height: u32) -> Vec<(u32, u32)> {
        (0..height).flat_map(|y| (0..width).map(move |x| (x, y))).collect()
    }

    #[test]
    fn test_area_is_pixel_ratio() {
        // 30x20 wound with a 400 px patch: 600 / 400 cm²
        let mask = SegmentationMask::from_fn(100, 100, |x, y| x < 30 && y < 20);
        let classification = Classification::new(
            100,
            100,
            vec![region(TissueKind::Granulation, 0.9, all_pixels(100, 100))],
        );

        let m = MeasurementAggregator::default()
            .aggregate(&calibration(400), &mask, &classification, 0.2, 0.1, &context())
            .unwrap();

        assert!((m.area_cm2 - 1.5).abs() < 1e-12);
        assert_eq!(m.tissue_fractions.len(), 1);
        assert!((m.tissue_fraction(TissueKind::Granulation) - 1.0).abs() < 1e-12);
        assert!(m.patient_is_diabetic);
        assert_eq!(m.wound_id, WoundId::from("w1"));
    }

    #[test]
    fn test_fractions_restricted_to_mask() {
        // wound is the left half; slough lies partly outside it
        let mask = SegmentationMask::from_fn(10, 10, |x, _| x < 5);
        let granulation: Vec<_> = all_pixels(10, 10).into_iter().filter(|&(x, y)| x < 5 && y < 7).collect();
        let slough: Vec<_> = all_pixels(10, 10).into_iter().filter(|&(_, y)| y >= 7).collect();
        let classification = Classification::new(
            10,
            10,
            vec![
                region(TissueKind::Granulation, 0.8, granulation),
                region(TissueKind::Slough, 0.7, slough),
            ],
        );

        let m = MeasurementAggregator::default()
            .aggregate(&calibration(100), &mask, &classification, 0.0, 0.0, &context())
            .unwrap();

        assert!((m.tissue_fraction(TissueKind::Granulation) - 0.7).abs() < 1e-12);
        assert!((m.tissue_fraction(TissueKind::Slough) - 0.3).abs() < 1e-12);
        let total: f64 = m.tissue_fractions.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_coverage_is_renormalised() {
        let mask = SegmentationMask::from_fn(10, 10, |_, _| true);
        let necrotic: Vec<_> = all_pixels(10, 10).into_iter().filter(|&(_, y)| y < 1).collect();
        let granulation: Vec<_> = all_pixels(10, 10).into_iter().filter(|&(_, y)| y == 1 || y == 2 || y == 3).collect();
        let classification = Classification::new(
            10,
            10,
            vec![
                region(TissueKind::Necrotic, 0.9, necrotic),
                region(TissueKind::Granulation, 0.9, granulation),
            ],
        );

        let m = MeasurementAggregator::default()
            .aggregate(&calibration(100), &mask, &classification, 0.0, 0.0, &context())
            .unwrap();

        assert!((m.tissue_fraction(TissueKind::Necrotic) - 0.25).abs() < 1e-12);
        assert!((m.tissue_fraction(TissueKind::Granulation) - 0.75).abs() < 1e-12);
        // area still counts every wound pixel
        assert!((m.area_cm2 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_overlapping_regions_go_to_most_confident() {
        let mask = SegmentationMask::from_fn(4, 1, |_, _| true);
        let classification = Classification::new(
            4,
            1,
            vec![
                region(TissueKind::Slough, 0.4, vec![(0, 0), (1, 0), (2, 0), (3, 0)]),
                region(TissueKind::Necrotic, 0.9, vec![(0, 0)]),
            ],
        );

        let m = MeasurementAggregator::default()
            .aggregate(&calibration(4), &mask, &classification, 0.0, 0.0, &context())
            .unwrap();

        assert!((m.tissue_fraction(TissueKind::Necrotic) - 0.25).abs() < 1e-12);
        assert!((m.tissue_fraction(TissueKind::Slough) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_less_confident_region_keeps_no_claimed_pixels() {
        // non-square image, claims at both corners of the pixel table
        let mask = SegmentationMask::from_fn(3, 2, |_, _| true);
        let classification = Classification::new(
            3,
            2,
            vec![
                region(TissueKind::Granulation, 0.9, vec![(0, 0), (2, 1)]),
                region(TissueKind::Slough, 0.5, all_pixels(3, 2)),
            ],
        );

        let m = MeasurementAggregator::default()
            .aggregate(&calibration(6), &mask, &classification, 0.0, 0.0, &context())
            .unwrap();

        assert!((m.tissue_fraction(TissueKind::Granulation) - 2.0 / 6.0).abs() < 1e-12);
        assert!((m.tissue_fraction(TissueKind::Slough) - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_mask() {
        let mask = SegmentationMask::from_fn(10, 10, |_, _| false);
        let classification = Classification::new(10, 10, vec![]);
        let err = MeasurementAggregator::default()
            .aggregate(&calibration(100), &mask, &classification, 0.0, 0.0, &context())
            .unwrap_err();
        assert_eq!(err, AggregationError::EmptyMask);
        assert_eq!(err.reason(), "empty_mask");
    }

    #[test]
    fn test_no_overlap() {
        let mask = SegmentationMask::from_fn(10, 10, |x, _| x < 3);
        let classification = Classification::new(
            10,
            10,
            vec![region(TissueKind::Granulation, 1.0, vec![(8, 8), (9, 9)])],
        );
        let err = MeasurementAggregator::default()
            .aggregate(&calibration(100), &mask, &classification, 0.0, 0.0, &context())
            .unwrap_err();
        assert_eq!(err, AggregationError::NoOverlap);
        assert_eq!(err.reason(), "no_overlap");
    }

    #[test]
    fn test_dimension_mismatch() {
        let mask = SegmentationMask::from_fn(10, 10, |_, _| true);
        let classification = Classification::new(20, 10, vec![]);
        let err = MeasurementAggregator::default()
            .aggregate(&calibration(100), &mask, &classification, 0.0, 0.0, &context())
            .unwrap_err();
        assert!(matches!(err, AggregationError::DimensionMismatch { class_width: 20, .. }));
    }

    #[test]
    fn test_scores_are_clamped() {
        let mask = SegmentationMask::from_fn(2, 2, |_, _| true);
        let classification =
            Classification::new(2, 2, vec![region(TissueKind::Other, 1.0, all_pixels(2, 2))]);
        let aggregator = MeasurementAggregator::default();

        let m = aggregator
            .aggregate(&calibration(4), &mask, &classification, 1.7, -0.2, &context())
            .unwrap();
        assert_eq!(m.redness_score, 1.0);
        assert_eq!(m.pus_score, 0.0);

        let m = aggregator
            .aggregate(&calibration(4), &mask, &classification, f64::NAN, 0.35, &context())
            .unwrap();
        assert_eq!(m.redness_score, 0.0);
        assert_eq!(m.pus_score, 0.35);
    }

    #[test]
    fn test_custom_mask_threshold() {
        let mut probs = ndarray::Array2::<f32>::zeros((1, 4));
        probs[[0, 0]] = 0.6;
        probs[[0, 1]] = 0.8;
        probs[[0, 2]] = 0.95;
        let mask = SegmentationMask::from_probabilities(probs);
        let classification =
            Classification::new(4, 1, vec![region(TissueKind::Granulation, 1.0, all_pixels(4, 1))]);

        let strict = MeasurementAggregator::new(AggregationConfig { mask_threshold: 0.75 });
        let m = strict
            .aggregate(&calibration(1), &mask, &classification, 0.0, 0.0, &context())
            .unwrap();
        assert_eq!(m.area_cm2, 2.0);

        let m = MeasurementAggregator::default()
            .aggregate(&calibration(1), &mask, &classification, 0.0, 0.0, &context())
            .unwrap();
        assert_eq!(m.area_cm2, 3.0);
    }
}
