//! Scan analysis pipeline
//!
//! Wires calibration, segmentation, tissue classification and aggregation into
//! one per-image step, and the trend engine plus forecaster into a per-wound
//! assessment. Persisting the measurement happens here, between the two, so
//! the engines themselves only ever see read-only history snapshots.

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use woundtrack_common::{AlertResult, CalibrationResult, ForecastResult, HealingHistory, Measurement, WoundId};

use crate::aggregation::{AggregationError, MeasurementAggregator, ScanContext};
use crate::calibration::{self, CalibrationError};
use crate::config::WoundtrackConfig;
use crate::forecast::{self, ForecastError, TrajectoryForecaster};
use crate::inference::{Segmenter, ServiceError, TissueClassifier};
use crate::store::{HistoryStore, StoreError};
use crate::trend::{self, TrendEngine};

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("calibration failed: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid forecast horizon: {0}")]
    Forecast(#[from] ForecastError),
}

impl AnalysisError {
    /// Machine-readable reason code
    pub fn reason(&self) -> &'static str {
        match self {
            AnalysisError::Calibration(e) => e.reason(),
            AnalysisError::Aggregation(e) => e.reason(),
            AnalysisError::Service(ServiceError::SegmentationUnavailable(_)) => {
                "segmentation_unavailable"
            }
            AnalysisError::Service(ServiceError::ClassificationUnavailable(_)) => {
                "classification_unavailable"
            }
            AnalysisError::Store(_) => "store_failure",
            AnalysisError::Forecast(_) => "invalid_horizon",
        }
    }
}

/// Result of analysing a single image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanAnalysis {
    pub calibration: CalibrationResult,
    pub measurement: Measurement,
}

/// Early warnings and forecast for one wound history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub wound_id: WoundId,
    pub measurement_count: usize,
    pub alerts: AlertResult,
    pub forecast: ForecastResult,
    /// Percent area reduction since the previous scan
    pub healing_score: Option<f64>,
}

/// Everything produced by one scan: the new measurement and the reassessed history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub scan: ScanAnalysis,
    pub assessment: Assessment,
}

/// Trend evaluation and forecasting over a stored history, no image work involved
pub struct HistoryAssessor {
    trend: TrendEngine,
    forecaster: TrajectoryForecaster,
}

impl HistoryAssessor {
    pub fn new(config: &WoundtrackConfig) -> Self {
        Self {
            trend: TrendEngine::new(config.trend.clone()),
            forecaster: TrajectoryForecaster::new(config.forecast.clone()),
        }
    }

    /// Evaluate early warnings and forecast the trajectory over `horizon`
    pub fn assess(
        &self,
        history: &HealingHistory,
        horizon: &[DateTime<Utc>],
    ) -> Result<Assessment, ForecastError> {
        let alerts = self.trend.evaluate(history);
        let forecast = self.forecaster.forecast(history, horizon)?;
        Ok(Assessment {
            wound_id: history.wound_id().clone(),
            measurement_count: history.len(),
            alerts,
            forecast,
            healing_score: trend::healing_score(history),
        })
    }
}

pub struct WoundAnalyzer<S, C> {
    config: WoundtrackConfig,
    segmenter: S,
    classifier: C,
    aggregator: MeasurementAggregator,
    assessor: HistoryAssessor,
}

impl<S: Segmenter, C: TissueClassifier> WoundAnalyzer<S, C> {
    pub fn new(config: WoundtrackConfig, segmenter: S, classifier: C) -> Self {
        Self {
            aggregator: MeasurementAggregator::new(config.aggregation.clone()),
            assessor: HistoryAssessor::new(&config),
            config,
            segmenter,
            classifier,
        }
    }

    /// Calibrate, segment, classify and aggregate one image.
    ///
    /// Calibration runs first so a photo without a usable patch never reaches
    /// the inference backends.
    pub fn analyze(
        &self,
        image: &RgbImage,
        redness_raw: f64,
        pus_raw: f64,
        context: &ScanContext,
    ) -> Result<ScanAnalysis, AnalysisError> {
        let calibration = calibration::calibrate(image, &self.config.calibration)?;
        let mask = self.segmenter.segment(image)?;
        let classification = self.classifier.classify(image, &mask)?;
        let measurement = self.aggregator.aggregate(
            &calibration,
            &mask,
            &classification,
            redness_raw,
            pus_raw,
            context,
        )?;

        info!(
            "Wound {}: {:.3} cm² at {}",
            measurement.wound_id, measurement.area_cm2, measurement.timestamp
        );
        Ok(ScanAnalysis {
            calibration,
            measurement,
        })
    }

    /// Analyse an image, append the measurement to `store` and reassess the wound.
    ///
    /// Nothing is written when the analysis fails. `horizon` is validated
    /// against the updated history, so it must lie after the new scan.
    pub fn process_scan(
        &self,
        store: &dyn HistoryStore,
        image: &RgbImage,
        redness_raw: f64,
        pus_raw: f64,
        context: &ScanContext,
        horizon: &[DateTime<Utc>],
    ) -> Result<ScanReport, AnalysisError> {
        let scan = self.analyze(image, redness_raw, pus_raw, context)?;
        let stored = store.read(&context.wound_id)?;
        let last_observed = stored
            .latest()
            .map(|m| m.timestamp)
            .max(Some(context.timestamp));
        forecast::validate_horizon(last_observed, horizon)?;
        store.append(&context.wound_id, scan.measurement.clone())?;
        let history = store.read(&context.wound_id)?;
        let assessment = self.assessor.assess(&history, horizon)?;
        Ok(ScanReport { scan, assessment })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{Classification, ClassifiedRegion, SegmentationMask};
    use crate::store::InMemoryHistoryStore;
    use chrono::{Duration, TimeZone};
    use image::Rgb;
    use woundtrack_common::TissueKind;

    const GREEN: Rgb<u8> = Rgb([30, 200, 60]);
    const SKIN: Rgb<u8> = Rgb([200, 160, 140]);

    /// 100x100 photo with a 20x20 patch in the corner
    fn photo() -> RgbImage {
        RgbImage::from_fn(100, 100, |x, y| if x < 20 && y < 20 { GREEN } else { SKIN })
    }

    struct FixedSegmenter;

    impl Segmenter for FixedSegmenter {
        fn segment(&self, image: &RgbImage) -> Result<SegmentationMask, ServiceError> {
            // 40x20 wound = 800 px = 2 cm² against a 400 px patch
            Ok(SegmentationMask::from_fn(image.width(), image.height(), |x, y| {
                (50..90).contains(&x) && (50..70).contains(&y)
            }))
        }
    }

    struct DownSegmenter;

    impl Segmenter for DownSegmenter {
        fn segment(&self, _image: &RgbImage) -> Result<SegmentationMask, ServiceError> {
            Err(ServiceError::SegmentationUnavailable("connection refused".to_string()))
        }
    }

    struct AllGranulation;

    impl TissueClassifier for AllGranulation {
        fn classify(
            &self,
            image: &RgbImage,
            mask: &SegmentationMask,
        ) -> Result<Classification, ServiceError> {
            let pixels = image
                .enumerate_pixels()
                .map(|(x, y, _)| (x, y))
                .filter(|&(x, y)| mask.is_wound(x, y, 0.5))
                .collect();
            Ok(Classification::new(
                image.width(),
                image.height(),
                vec![ClassifiedRegion {
                    kind: TissueKind::Granulation,
                    confidence: 0.9,
                    pixels,
                }],
            ))
        }
    }

    fn context(day: i64) -> ScanContext {
        ScanContext {
            wound_id: WoundId::from("heel"),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap() + Duration::days(day),
            patient_is_diabetic: false,
        }
    }

    #[test]
    fn test_analyze_produces_calibrated_area() {
        let analyzer = WoundAnalyzer::new(WoundtrackConfig::default(), FixedSegmenter, AllGranulation);
        let scan = analyzer.analyze(&photo(), 0.2, 0.0, &context(0)).unwrap();
        assert_eq!(scan.calibration.patch_pixel_area, 400);
        assert!((scan.measurement.area_cm2 - 2.0).abs() < 1e-9);
        assert_eq!(scan.measurement.tissue_fraction(TissueKind::Granulation), 1.0);
    }

    #[test]
    fn test_missing_patch_aborts_before_inference() {
        let analyzer = WoundAnalyzer::new(WoundtrackConfig::default(), DownSegmenter, AllGranulation);
        let blank = RgbImage::from_pixel(100, 100, SKIN);
        let err = analyzer.analyze(&blank, 0.0, 0.0, &context(0)).unwrap_err();
        assert_eq!(err.reason(), "patch_not_found");
    }

    #[test]
    fn test_service_failure_passes_through() {
        let analyzer = WoundAnalyzer::new(WoundtrackConfig::default(), DownSegmenter, AllGranulation);
        let err = analyzer.analyze(&photo(), 0.0, 0.0, &context(0)).unwrap_err();
        assert_eq!(err.reason(), "segmentation_unavailable");
    }

    #[test]
    fn test_process_scan_appends_and_assesses() {
        let analyzer = WoundAnalyzer::new(WoundtrackConfig::default(), FixedSegmenter, AllGranulation);
        let store = InMemoryHistoryStore::new();

        let first = analyzer
            .process_scan(&store, &photo(), 0.2, 0.0, &context(0), &[])
            .unwrap();
        assert_eq!(first.assessment.measurement_count, 1);
        assert!(first.assessment.alerts.is_insufficient());
        assert!(first.assessment.forecast.insufficient_data);

        for day in [7, 14] {
            analyzer
                .process_scan(&store, &photo(), 0.2, 0.0, &context(day), &[])
                .unwrap();
        }
        let horizon = [context(28).timestamp];
        let report = analyzer
            .process_scan(&store, &photo(), 0.2, 0.0, &context(21), &horizon)
            .unwrap();
        assert_eq!(report.assessment.measurement_count, 4);
        assert!(report.assessment.alerts.stalled);
        assert_eq!(report.assessment.healing_score, Some(0.0));
        assert_eq!(report.assessment.forecast.predicted_points.len(), 1);

        // Same timestamp again is rejected by the store
        let err = analyzer
            .process_scan(&store, &photo(), 0.2, 0.0, &context(21), &horizon)
            .unwrap_err();
        assert_eq!(err.reason(), "store_failure");
        assert_eq!(store.read(&WoundId::from("heel")).unwrap().len(), 4);
    }

    #[test]
    fn test_rejected_horizon_writes_nothing() {
        let analyzer = WoundAnalyzer::new(WoundtrackConfig::default(), FixedSegmenter, AllGranulation);
        let store = InMemoryHistoryStore::new();

        let err = analyzer
            .process_scan(&store, &photo(), 0.2, 0.0, &context(0), &[context(0).timestamp])
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_horizon");
        assert!(store.wound_ids().unwrap().is_empty());

        analyzer
            .process_scan(&store, &photo(), 0.2, 0.0, &context(7), &[context(14).timestamp])
            .unwrap();
        // Horizon after the new scan but before an already stored one
        let err = analyzer
            .process_scan(&store, &photo(), 0.2, 0.0, &context(3), &[context(5).timestamp])
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_horizon");
        assert_eq!(store.read(&WoundId::from("heel")).unwrap().len(), 1);

        let report = analyzer
            .process_scan(&store, &photo(), 0.2, 0.0, &context(14), &[context(21).timestamp])
            .unwrap();
        assert_eq!(report.assessment.measurement_count, 2);
    }

    #[test]
    fn test_failed_analysis_writes_nothing() {
        let analyzer = WoundAnalyzer::new(WoundtrackConfig::default(), DownSegmenter, AllGranulation);
        let store = InMemoryHistoryStore::new();
        assert!(analyzer
            .process_scan(&store, &photo(), 0.0, 0.0, &context(0), &[])
            .is_err());
        assert!(store.wound_ids().unwrap().is_empty());
    }
}
