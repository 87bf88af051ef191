use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a single tracked wound
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WoundId(String);

impl WoundId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WoundId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for WoundId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Tissue kinds reported by the classification service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TissueKind {
    /// Healthy red granulation tissue
    Granulation,
    /// Yellow fibrinous slough
    Slough,
    /// Black or brown necrotic eschar
    Necrotic,
    /// New pink epithelium at the wound edge
    Epithelial,
    /// Anything the classifier could not place
    Other,
}

impl TissueKind {
    pub const ALL: [TissueKind; 5] = [
        TissueKind::Granulation,
        TissueKind::Slough,
        TissueKind::Necrotic,
        TissueKind::Epithelial,
        TissueKind::Other,
    ];

    /// Pixel value used for this kind in grayscale label maps.
    /// Zero is reserved for "unlabelled".
    pub fn label_code(&self) -> u8 {
        match self {
            TissueKind::Granulation => 1,
            TissueKind::Slough => 2,
            TissueKind::Necrotic => 3,
            TissueKind::Epithelial => 4,
            TissueKind::Other => 5,
        }
    }

    /// Inverse of [`TissueKind::label_code`]
    pub fn from_label_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label_code() == code)
    }
}

impl fmt::Display for TissueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TissueKind::Granulation => write!(f, "granulation"),
            TissueKind::Slough => write!(f, "slough"),
            TissueKind::Necrotic => write!(f, "necrotic"),
            TissueKind::Epithelial => write!(f, "epithelial"),
            TissueKind::Other => write!(f, "other"),
        }
    }
}

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Pixel-to-area scale derived from the 1 cm² calibration patch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Physical area covered by one pixel, in cm²
    pub scale_cm2_per_px: f64,
    /// Detection confidence in [0, 1]
    pub patch_confidence: f64,
    /// Pixel count of the detected patch (represents exactly 1 cm²)
    pub patch_pixel_area: u64,
    /// Region area over convex hull area
    pub patch_solidity: f64,
    /// Where the patch was found
    pub patch_bounds: PixelBounds,
}

impl CalibrationResult {
    /// Convert a pixel count into cm²
    pub fn pixels_to_cm2(&self, pixels: u64) -> f64 {
        pixels as f64 * self.scale_cm2_per_px
    }
}

/// One analysed photograph of a wound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub wound_id: WoundId,
    pub timestamp: DateTime<Utc>,
    /// True wound area in cm²
    pub area_cm2: f64,
    /// Share of wound pixels per tissue kind; sums to 1 when non-empty
    pub tissue_fractions: BTreeMap<TissueKind, f64>,
    pub redness_score: f64,
    pub pus_score: f64,
    pub patient_is_diabetic: bool,
}

impl Measurement {
    /// Tissue kind covering the largest share of the wound bed
    pub fn dominant_tissue(&self) -> Option<TissueKind> {
        self.tissue_fractions
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(kind, _)| *kind)
    }

    pub fn tissue_fraction(&self, kind: TissueKind) -> f64 {
        self.tissue_fractions.get(&kind).copied().unwrap_or(0.0)
    }
}

/// Non-diagnostic infection risk tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfectionRisk {
    None,
    Watch,
    Elevated,
}

impl fmt::Display for InfectionRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfectionRisk::None => write!(f, "none"),
            InfectionRisk::Watch => write!(f, "watch"),
            InfectionRisk::Elevated => write!(f, "elevated"),
        }
    }
}

/// Machine-checkable reason codes attached to an [`AlertResult`]
pub mod rationale {
    pub const INSUFFICIENT_HISTORY: &str = "insufficient_history";
    pub const SHORT_WINDOW: &str = "short_window";
    pub const AREA_STALLED: &str = "area_stalled";
    pub const AREA_REGRESSING: &str = "area_regressing";
    pub const REDNESS_TRENDING_UP: &str = "redness_trending_up";
    pub const PUS_PRESENT_AND_RISING: &str = "pus_present_and_rising";
    pub const AREA_INCREASE_WITH_INFECTION_SIGNALS: &str = "area_increase_with_infection_signals";
}

/// Early-warning flags computed from a healing history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertResult {
    pub stalled: bool,
    pub regressing: bool,
    pub infection_risk: InfectionRisk,
    /// Ordered reason codes, see [`rationale`]
    pub rationale: Vec<String>,
    /// 1.0 for a full window, lower while the history is still growing
    pub confidence: f64,
    /// Number of measurements the rules looked at
    pub window_len: usize,
    /// Composite infection score the risk tier was read from
    pub infection_score: f64,
}

impl AlertResult {
    /// Inert result for histories too short to compare
    pub fn insufficient_history(window_len: usize) -> Self {
        Self {
            stalled: false,
            regressing: false,
            infection_risk: InfectionRisk::None,
            rationale: vec![rationale::INSUFFICIENT_HISTORY.to_string()],
            confidence: 0.0,
            window_len,
            infection_score: 0.0,
        }
    }

    pub fn is_insufficient(&self) -> bool {
        self.has_reason(rationale::INSUFFICIENT_HISTORY)
    }

    /// True when any flag asks for clinical attention
    pub fn requires_attention(&self) -> bool {
        self.stalled || self.regressing || self.infection_risk != InfectionRisk::None
    }

    pub fn has_reason(&self, code: &str) -> bool {
        self.rationale.iter().any(|r| r == code)
    }
}

/// Curve family that produced a forecast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastModel {
    ExponentialDecay,
    LinearFallback,
    None,
}

impl fmt::Display for ForecastModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForecastModel::ExponentialDecay => write!(f, "exponential decay"),
            ForecastModel::LinearFallback => write!(f, "linear fallback"),
            ForecastModel::None => write!(f, "none"),
        }
    }
}

/// Predicted wound area at one future timestamp
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub area_cm2: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl ForecastPoint {
    pub fn interval_width(&self) -> f64 {
        self.upper_bound - self.lower_bound
    }
}

/// Healing trajectory extrapolated over a horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub predicted_points: Vec<ForecastPoint>,
    pub model_confidence: f64,
    pub insufficient_data: bool,
    pub model: ForecastModel,
    /// First time the fitted curve reaches the closure area, if it ever does
    pub projected_closure: Option<DateTime<Utc>>,
}

impl ForecastResult {
    pub fn insufficient() -> Self {
        Self {
            predicted_points: Vec::new(),
            model_confidence: 0.0,
            insufficient_data: true,
            model: ForecastModel::None,
            projected_closure: None,
        }
    }
}
