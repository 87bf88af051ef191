// Policy constants for every pipeline stage.
// Defaults are placeholders pending clinical sign-off; deployments override them from TOML.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for '{field}': {message}")]
    Invalid { field: String, message: String },
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.into(),
    }
}

fn check_unit_interval(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, format!("must be within [0, 1], got {}", value)));
    }
    Ok(())
}

fn check_positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if !(value.is_finite() && value > 0.0) {
        return Err(invalid(field, format!("must be positive, got {}", value)));
    }
    Ok(())
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WoundtrackConfig {
    pub calibration: CalibrationConfig,
    pub aggregation: AggregationConfig,
    pub trend: TrendConfig,
    pub forecast: ForecastConfig,
}

impl WoundtrackConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate; missing sections and fields fall back to defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.calibration.validate()?;
        self.aggregation.validate()?;
        self.trend.validate()?;
        self.forecast.validate()
    }
}

/// Green patch detection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Hue band of the calibration green, in degrees
    pub hue_min_deg: f64,
    pub hue_max_deg: f64,
    pub min_saturation: f64,
    pub min_value: f64,
    /// Regions smaller than this are too far away to trust
    pub min_patch_pixels: u64,
    /// Minimum region area / convex hull area
    pub min_solidity: f64,
    /// Relative area difference under which two candidates count as a tie
    pub ambiguity_tolerance: f64,
    /// Patch-to-frame area ratios that earn full confidence
    pub ideal_area_fraction_min: f64,
    pub ideal_area_fraction_max: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            hue_min_deg: 80.0,
            hue_max_deg: 160.0,
            min_saturation: 0.35,
            min_value: 0.20,
            min_patch_pixels: 400,
            min_solidity: 0.85,
            ambiguity_tolerance: 0.05,
            ideal_area_fraction_min: 0.001,
            ideal_area_fraction_max: 0.15,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=360.0).contains(&self.hue_min_deg)
            || !(0.0..=360.0).contains(&self.hue_max_deg)
            || self.hue_min_deg >= self.hue_max_deg
        {
            return Err(invalid(
                "calibration.hue_min_deg",
                "hue band must satisfy 0 <= min < max <= 360",
            ));
        }
        check_unit_interval("calibration.min_saturation", self.min_saturation)?;
        check_unit_interval("calibration.min_value", self.min_value)?;
        check_unit_interval("calibration.min_solidity", self.min_solidity)?;
        check_unit_interval("calibration.ambiguity_tolerance", self.ambiguity_tolerance)?;
        if self.min_patch_pixels == 0 {
            return Err(invalid("calibration.min_patch_pixels", "must be at least 1"));
        }
        check_positive("calibration.ideal_area_fraction_min", self.ideal_area_fraction_min)?;
        if self.ideal_area_fraction_max <= self.ideal_area_fraction_min
            || self.ideal_area_fraction_max > 1.0
        {
            return Err(invalid(
                "calibration.ideal_area_fraction_max",
                "must be above ideal_area_fraction_min and at most 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Probability above which a mask pixel counts as wound
    pub mask_threshold: f32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { mask_threshold: 0.5 }
    }
}

impl AggregationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.mask_threshold) {
            return Err(invalid("aggregation.mask_threshold", "must be within [0, 1)"));
        }
        Ok(())
    }
}

/// Thresholds for one patient risk tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskTierThresholds {
    /// Relative area band counted as "no meaningful change"
    pub stall_epsilon: f64,
    /// Relative growth over the window that counts as regression
    pub regression_threshold: f64,
    /// Infection score cutoffs
    pub watch_cutoff: f64,
    pub elevated_cutoff: f64,
}

impl RiskTierThresholds {
    pub fn standard() -> Self {
        Self {
            stall_epsilon: 0.05,
            regression_threshold: 0.10,
            watch_cutoff: 0.35,
            elevated_cutoff: 0.65,
        }
    }

    pub fn diabetic() -> Self {
        Self {
            stall_epsilon: 0.03,
            regression_threshold: 0.05,
            watch_cutoff: 0.30,
            elevated_cutoff: 0.55,
        }
    }

    fn validate(&self, tier: &str) -> Result<(), ConfigError> {
        check_unit_interval(&format!("trend.{}.stall_epsilon", tier), self.stall_epsilon)?;
        check_positive(
            &format!("trend.{}.regression_threshold", tier),
            self.regression_threshold,
        )?;
        if self.regression_threshold < self.stall_epsilon {
            return Err(invalid(
                &format!("trend.{}.regression_threshold", tier),
                "must not be below stall_epsilon",
            ));
        }
        check_unit_interval(&format!("trend.{}.watch_cutoff", tier), self.watch_cutoff)?;
        check_unit_interval(&format!("trend.{}.elevated_cutoff", tier), self.elevated_cutoff)?;
        if self.elevated_cutoff < self.watch_cutoff {
            return Err(invalid(
                &format!("trend.{}.elevated_cutoff", tier),
                "must not be below watch_cutoff",
            ));
        }
        Ok(())
    }
}

/// Weights and per-signal thresholds of the infection proxy.
/// Slopes are expressed per week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfectionSignalConfig {
    pub redness_weight: f64,
    pub pus_weight: f64,
    pub area_weight: f64,
    /// Slope above which a signal is reported as rising
    pub redness_slope_threshold: f64,
    pub pus_slope_threshold: f64,
    /// Slope that saturates a signal's contribution
    pub redness_slope_saturation: f64,
    pub pus_slope_saturation: f64,
    /// Latest pus score needed before pus counts as present
    pub pus_presence_floor: f64,
}

impl Default for InfectionSignalConfig {
    fn default() -> Self {
        Self {
            redness_weight: 0.4,
            pus_weight: 0.4,
            area_weight: 0.2,
            redness_slope_threshold: 0.05,
            pus_slope_threshold: 0.05,
            redness_slope_saturation: 0.2,
            pus_slope_saturation: 0.2,
            pus_presence_floor: 0.1,
        }
    }
}

impl InfectionSignalConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, weight) in [
            ("trend.infection.redness_weight", self.redness_weight),
            ("trend.infection.pus_weight", self.pus_weight),
            ("trend.infection.area_weight", self.area_weight),
        ] {
            check_unit_interval(field, weight)?;
        }
        let total = self.redness_weight + self.pus_weight + self.area_weight;
        if (total - 1.0).abs() > 1e-6 {
            return Err(invalid(
                "trend.infection",
                format!("weights must sum to 1, got {}", total),
            ));
        }
        check_positive("trend.infection.redness_slope_saturation", self.redness_slope_saturation)?;
        check_positive("trend.infection.pus_slope_saturation", self.pus_slope_saturation)?;
        check_unit_interval("trend.infection.pus_presence_floor", self.pus_presence_floor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Number of most recent measurements the rules look at
    pub window: usize,
    pub standard: RiskTierThresholds,
    pub diabetic: RiskTierThresholds,
    pub infection: InfectionSignalConfig,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            window: 4,
            standard: RiskTierThresholds::standard(),
            diabetic: RiskTierThresholds::diabetic(),
            infection: InfectionSignalConfig::default(),
        }
    }
}

impl TrendConfig {
    pub fn tier(&self, patient_is_diabetic: bool) -> &RiskTierThresholds {
        if patient_is_diabetic {
            &self.diabetic
        } else {
            &self.standard
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window < 2 {
            return Err(invalid("trend.window", "must be at least 2"));
        }
        self.standard.validate("standard")?;
        self.diabetic.validate("diabetic")?;
        self.infection.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Fewer measurements than this yield an insufficient-data forecast
    pub min_points: usize,
    /// z-score of the prediction interval
    pub interval_z: f64,
    /// Search range for the decay rate, per day
    pub decay_rate_min: f64,
    pub decay_rate_max: f64,
    pub grid_steps: usize,
    pub refine_tolerance: f64,
    pub max_refine_iterations: usize,
    /// Confidence reported when the linear fallback is used
    pub fallback_confidence: f64,
    /// Relative RMSE at which the fit confidence halves
    pub residual_reference: f64,
    /// Lower bound on the residual spread, as a fraction of the mean observed area
    pub min_sigma_fraction: f64,
    /// Area at or below which the wound counts as closed
    pub closure_area_cm2: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            min_points: 3,
            interval_z: 1.96,
            decay_rate_min: 1e-4,
            decay_rate_max: 2.0,
            grid_steps: 64,
            refine_tolerance: 1e-7,
            max_refine_iterations: 200,
            fallback_confidence: 0.1,
            residual_reference: 0.1,
            min_sigma_fraction: 0.01,
            closure_area_cm2: 0.05,
        }
    }
}

impl ForecastConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_points < 3 {
            return Err(invalid("forecast.min_points", "a curve needs at least 3 points"));
        }
        check_positive("forecast.interval_z", self.interval_z)?;
        check_positive("forecast.decay_rate_min", self.decay_rate_min)?;
        if self.decay_rate_max <= self.decay_rate_min {
            return Err(invalid(
                "forecast.decay_rate_max",
                "must be above decay_rate_min",
            ));
        }
        if self.grid_steps < 3 {
            return Err(invalid("forecast.grid_steps", "must be at least 3"));
        }
        check_positive("forecast.refine_tolerance", self.refine_tolerance)?;
        if self.max_refine_iterations == 0 {
            return Err(invalid("forecast.max_refine_iterations", "must be at least 1"));
        }
        check_unit_interval("forecast.fallback_confidence", self.fallback_confidence)?;
        check_positive("forecast.residual_reference", self.residual_reference)?;
        check_unit_interval("forecast.min_sigma_fraction", self.min_sigma_fraction)?;
        if !(self.closure_area_cm2.is_finite() && self.closure_area_cm2 >= 0.0) {
            return Err(invalid("forecast.closure_area_cm2", "must be non-negative"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        WoundtrackConfig::default().validate().unwrap();
    }

    #[test]
    fn test_diabetic_tier_is_stricter() {
        let trend = TrendConfig::default();
        assert!(trend.diabetic.stall_epsilon < trend.standard.stall_epsilon);
        assert!(trend.diabetic.regression_threshold < trend.standard.regression_threshold);
        assert!(trend.diabetic.elevated_cutoff <= trend.standard.elevated_cutoff);
        assert_eq!(trend.tier(true), &trend.diabetic);
        assert_eq!(trend.tier(false), &trend.standard);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WoundtrackConfig::from_toml_str(
            r#"
            [trend]
            window = 5

            [trend.diabetic]
            stall_epsilon = 0.02
            regression_threshold = 0.04
            watch_cutoff = 0.25
            elevated_cutoff = 0.5

            [calibration]
            min_patch_pixels = 900
            "#,
        )
        .unwrap();

        assert_eq!(config.trend.window, 5);
        assert_eq!(config.trend.diabetic.stall_epsilon, 0.02);
        assert_eq!(config.trend.standard, RiskTierThresholds::standard());
        assert_eq!(config.calibration.min_patch_pixels, 900);
        assert_eq!(config.calibration.min_solidity, 0.85);
        assert_eq!(config.forecast, ForecastConfig::default());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = WoundtrackConfig::from_toml_str("").unwrap();
        assert_eq!(config, WoundtrackConfig::default());
    }

    #[test]
    fn test_invalid_window_rejected() {
        let err = WoundtrackConfig::from_toml_str("[trend]\nwindow = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "trend.window"));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = WoundtrackConfig::default();
        config.trend.infection.area_weight = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = WoundtrackConfig::from_toml_str("[trend\nwindow = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("woundtrack.toml");
        std::fs::write(&path, "[forecast]\ninterval_z = 1.645\n").unwrap();
        let config = WoundtrackConfig::from_file(&path).unwrap();
        assert_eq!(config.forecast.interval_z, 1.645);
    }
}
