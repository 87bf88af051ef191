//! Wound photo measurement and healing trajectory analysis.
//!
//! Converts a wound photograph with a green 1 cm² calibration patch into an
//! area and tissue-mix measurement, then tracks the healing history of each
//! wound for stalls, regressions and infection signals and forecasts where
//! the area is heading.

pub mod aggregation;
pub mod analysis;
pub mod calibration;
pub mod config;
pub mod forecast;
pub mod inference;
pub mod logging;
pub mod store;
pub mod trend;

pub use aggregation::{AggregationError, MeasurementAggregator, ScanContext};
pub use analysis::{
    AnalysisError, Assessment, HistoryAssessor, ScanAnalysis, ScanReport, WoundAnalyzer,
};
pub use calibration::{calibrate, draw_patch_overlay, CalibrationError};
pub use config::{ConfigError, WoundtrackConfig};
pub use forecast::{CurveFitter, ForecastError, TrajectoryForecaster};
pub use inference::{
    Classification, ClassifiedRegion, LabelMapClassifier, MaskImageSegmenter, SegmentationMask,
    Segmenter, ServiceError, TissueClassifier,
};
pub use store::{HistoryStore, InMemoryHistoryStore, JsonHistoryStore, StoreError};
pub use trend::{healing_score, TrendEngine};
pub use woundtrack_common::*;
