// Trend and early-warning rules over a wound's healing history

use tracing::{debug, info};
use woundtrack_common::{rationale, AlertResult, HealingHistory, InfectionRisk, Measurement};

use crate::config::{InfectionSignalConfig, TrendConfig};

/// Areas at or below this are treated as a closed wound
const CLOSED_AREA_CM2: f64 = 1e-9;

/// Windows shorter than this cannot be compared
const MIN_WINDOW: usize = 2;

/// Slopes smaller than this are exactly flat
const FLAT_SLOPE: f64 = 1e-12;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Per-week least-squares slopes of the tracked signals over the window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSlopes {
    pub area_cm2: f64,
    pub redness: f64,
    pub pus: f64,
}

impl WindowSlopes {
    fn of(window: &[Measurement]) -> Self {
        let origin = window[0].timestamp;
        let weeks: Vec<f64> = window
            .iter()
            .map(|m| (m.timestamp - origin).num_seconds() as f64 / SECONDS_PER_DAY / 7.0)
            .collect();

        let slope_of = |values: Vec<f64>| flatten(least_squares_slope(&weeks, &values));
        Self {
            area_cm2: slope_of(window.iter().map(|m| m.area_cm2).collect()),
            redness: slope_of(window.iter().map(|m| m.redness_score).collect()),
            pus: slope_of(window.iter().map(|m| m.pus_score).collect()),
        }
    }
}

/// Rule-based evaluator. Holds only configuration; every call is a pure function of its input.
#[derive(Debug, Clone, Default)]
pub struct TrendEngine {
    config: TrendConfig,
}

impl TrendEngine {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, history: &HealingHistory) -> AlertResult {
        if history.len() < 2 {
            debug!("Wound {}: {} measurement(s), not enough to compare", history.wound_id(), history.len());
            return AlertResult::insufficient_history(history.len());
        }

        let window_size = self.config.window.max(MIN_WINDOW);
        let window = history.window(window_size);
        let window_len = window.len();
        let latest = &window[window_len - 1];
        let tier = self.config.tier(latest.patient_is_diabetic);
        let mut reasons: Vec<&'static str> = Vec::new();

        if window_len < window_size {
            reasons.push(rationale::SHORT_WINDOW);
        }

        let first_area = window[0].area_cm2;
        let (stalled, regressing) = if first_area <= CLOSED_AREA_CM2 {
            // a closed wound cannot stall; any new area means it reopened
            (false, latest.area_cm2 > CLOSED_AREA_CM2)
        } else {
            let relative: Vec<f64> = window
                .iter()
                .map(|m| (m.area_cm2 - first_area) / first_area)
                .collect();
            let net_change = relative[window_len - 1];
            let regressing = net_change > tier.regression_threshold;
            let within_band = relative.iter().all(|r| r.abs() <= tier.stall_epsilon);
            debug!(
                "Area change over {} scan(s): {:+.3} (band ±{:.3}, regression > {:.3})",
                window_len, net_change, tier.stall_epsilon, tier.regression_threshold
            );
            (within_band && !regressing, regressing)
        };

        if stalled {
            reasons.push(rationale::AREA_STALLED);
        }
        if regressing {
            reasons.push(rationale::AREA_REGRESSING);
        }

        let slopes = WindowSlopes::of(window);
        let infection = &self.config.infection;
        let redness_rising = slopes.redness > infection.redness_slope_threshold;
        let pus_rising =
            slopes.pus > infection.pus_slope_threshold && latest.pus_score >= infection.pus_presence_floor;
        let signals = InfectionSignals {
            redness_rising,
            pus_rising,
            area_with_signals: slopes.area_cm2 > 0.0 && (redness_rising || pus_rising),
        };

        if signals.redness_rising {
            reasons.push(rationale::REDNESS_TRENDING_UP);
        }
        if signals.pus_rising {
            reasons.push(rationale::PUS_PRESENT_AND_RISING);
        }
        if signals.area_with_signals {
            reasons.push(rationale::AREA_INCREASE_WITH_INFECTION_SIGNALS);
        }

        let infection_score = infection_score(&slopes, &signals, infection);
        // a zero score means no signal fired, whatever the cutoffs say
        let infection_risk = if infection_score <= 0.0 {
            InfectionRisk::None
        } else if infection_score >= tier.elevated_cutoff {
            InfectionRisk::Elevated
        } else if infection_score >= tier.watch_cutoff {
            InfectionRisk::Watch
        } else {
            InfectionRisk::None
        };

        debug!(
            "Slopes per week: area {:+.4}, redness {:+.4}, pus {:+.4}; infection score {:.3}",
            slopes.area_cm2, slopes.redness, slopes.pus, infection_score
        );

        let result = AlertResult {
            stalled,
            regressing,
            infection_risk,
            rationale: reasons.into_iter().map(String::from).collect(),
            confidence: (window_len as f64 / window_size as f64).min(1.0),
            window_len,
            infection_score,
        };

        info!(
            "Wound {}: stalled={}, regressing={}, infection risk {} ({})",
            history.wound_id(),
            result.stalled,
            result.regressing,
            result.infection_risk,
            result.rationale.join(", ")
        );

        result
    }
}

/// Infection signals that passed their own thresholds; each one has a rationale code
#[derive(Debug, Clone, Copy)]
struct InfectionSignals {
    redness_rising: bool,
    pus_rising: bool,
    area_with_signals: bool,
}

/// Weighted composite of the normalised redness and pus slopes plus area growth.
/// Only signals that fired contribute, so a non-zero score is always explained.
fn infection_score(
    slopes: &WindowSlopes,
    signals: &InfectionSignals,
    config: &InfectionSignalConfig,
) -> f64 {
    let mut score = 0.0;
    if signals.redness_rising {
        score += config.redness_weight * (slopes.redness / config.redness_slope_saturation).clamp(0.0, 1.0);
    }
    if signals.pus_rising {
        score += config.pus_weight * (slopes.pus / config.pus_slope_saturation).clamp(0.0, 1.0);
    }
    if signals.area_with_signals {
        score += config.area_weight;
    }
    score
}

/// Ordinary least-squares slope of `ys` against `xs`; zero when `xs` has no spread
fn least_squares_slope(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len() as f64;
    if xs.len() < 2 {
        return 0.0;
    }
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        numerator += (x - mean_x) * (y - mean_y);
        denominator += (x - mean_x).powi(2);
    }

    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

fn flatten(slope: f64) -> f64 {
    if slope.abs() < FLAT_SLOPE {
        0.0
    } else {
        slope
    }
}

/// Percent area reduction since the previous scan; positive means the wound shrank.
/// `None` with fewer than two scans or a zero previous area.
pub fn healing_score(history: &HealingHistory) -> Option<f64> {
    let recent = history.window(2);
    if recent.len() < 2 {
        return None;
    }
    let previous = recent[0].area_cm2;
    let latest = recent[1].area_cm2;
    if previous <= 0.0 {
        return None;
    }
    Some((previous - latest) / previous * 100.0)
}
