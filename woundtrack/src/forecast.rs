//! Healing trajectory forecasting
//!
//! Fits a monotonically non-increasing curve to the area series of a wound and
//! extrapolates it over a caller-supplied horizon with widening prediction
//! intervals. The curve family sits behind [`CurveFitter`] so alternative
//! strategies can replace the default exponential decay without touching the
//! rest of the pipeline.

use chrono::{DateTime, Duration, Utc};
use std::fmt::Debug;
use thiserror::Error;
use tracing::{debug, info, warn};
use woundtrack_common::{ForecastModel, ForecastPoint, ForecastResult, HealingHistory};

use crate::config::ForecastConfig;

const MILLIS_PER_DAY: f64 = 86_400_000.0;
const NANOS_PER_DAY: f64 = 86_400_000_000_000.0;

/// Fewest samples a three-parameter curve can be fitted to
const MIN_FIT_POINTS: usize = 3;
const MIN_GRID_STEPS: usize = 3;

/// Closure projections further out than this are reported as "never"
const MAX_PROJECTION_DAYS: f64 = 36_500.0;

/// Malformed horizon input
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    #[error("horizon timestamps must be strictly increasing (entry {index} is not after the one before it)")]
    NonIncreasingHorizon { index: usize },

    #[error("horizon starts at {first}, which is not after the last observation at {last_observed}")]
    HorizonNotInFuture {
        first: DateTime<Utc>,
        last_observed: DateTime<Utc>,
    },
}

/// Why a curve fit was rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("need at least {required} samples, got {actual}")]
    TooFewSamples { required: usize, actual: usize },

    #[error("fit did not converge: {0}")]
    NotConverged(String),
}

/// One observation on the time axis, days since the first measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurveSample {
    pub t_days: f64,
    pub area_cm2: f64,
}

/// A fitted area-over-time curve
pub trait FittedCurve: Debug + Send + Sync {
    fn evaluate(&self, t_days: f64) -> f64;

    /// Number of free parameters, used for residual degrees of freedom
    fn parameter_count(&self) -> usize;

    /// First time at or after `from_days` where the curve is at or below `area_cm2`
    fn time_to_reach(&self, area_cm2: f64, from_days: f64) -> Option<f64>;
}

/// Strategy that fits a curve family to samples
pub trait CurveFitter: Send + Sync {
    fn model(&self) -> ForecastModel;

    fn fit(&self, samples: &[CurveSample]) -> Result<Box<dyn FittedCurve>, FitError>;
}

/// `A(t) = floor + amplitude * exp(-rate * t)` with all parameters non-negative
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayCurve {
    pub floor: f64,
    pub amplitude: f64,
    pub rate: f64,
}

impl FittedCurve for DecayCurve {
    fn evaluate(&self, t_days: f64) -> f64 {
        self.floor + self.amplitude * (-self.rate * t_days).exp()
    }

    fn parameter_count(&self) -> usize {
        3
    }

    fn time_to_reach(&self, area_cm2: f64, from_days: f64) -> Option<f64> {
        if self.evaluate(from_days) <= area_cm2 {
            return Some(from_days);
        }
        if area_cm2 <= self.floor || self.amplitude <= 0.0 || self.rate <= 0.0 {
            return None;
        }
        let t = -((area_cm2 - self.floor) / self.amplitude).ln() / self.rate;
        Some(t.max(from_days))
    }
}

/// Straight line through two points, never below zero
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearCurve {
    pub origin_days: f64,
    pub origin_area: f64,
    pub slope_per_day: f64,
}

impl LinearCurve {
    fn through(a: CurveSample, b: CurveSample) -> Self {
        let dt = b.t_days - a.t_days;
        let slope_per_day = if dt > 0.0 {
            (b.area_cm2 - a.area_cm2) / dt
        } else {
            0.0
        };
        Self {
            origin_days: b.t_days,
            origin_area: b.area_cm2,
            slope_per_day,
        }
    }
}

impl FittedCurve for LinearCurve {
    fn evaluate(&self, t_days: f64) -> f64 {
        (self.origin_area + self.slope_per_day * (t_days - self.origin_days)).max(0.0)
    }

    fn parameter_count(&self) -> usize {
        2
    }

    fn time_to_reach(&self, area_cm2: f64, from_days: f64) -> Option<f64> {
        if self.evaluate(from_days) <= area_cm2 {
            return Some(from_days);
        }
        if self.slope_per_day >= 0.0 {
            return None;
        }
        let t = self.origin_days + (area_cm2 - self.origin_area) / self.slope_per_day;
        Some(t.max(from_days))
    }
}

/// Least-squares exponential decay toward a floor.
///
/// For a fixed rate the model is linear in floor and amplitude, so each
/// candidate rate is solved in closed form. The rate itself is found by a
/// log-spaced grid search followed by golden-section refinement.
#[derive(Debug, Clone)]
pub struct ExponentialDecayFitter {
    rate_min: f64,
    rate_max: f64,
    grid_steps: usize,
    tolerance: f64,
    max_iterations: usize,
}

impl ExponentialDecayFitter {
    /// Out-of-range settings are widened to the smallest usable search
    pub fn from_config(config: &ForecastConfig) -> Self {
        let rate_min = if config.decay_rate_min > 0.0 {
            config.decay_rate_min
        } else {
            ForecastConfig::default().decay_rate_min
        };
        Self {
            rate_min,
            rate_max: config.decay_rate_max.max(rate_min * 2.0),
            grid_steps: config.grid_steps.max(MIN_GRID_STEPS),
            tolerance: config.refine_tolerance,
            max_iterations: config.max_refine_iterations.max(1),
        }
    }

    /// Best floor and amplitude for a fixed rate, with the constraints applied
    fn solve_linear(samples: &[CurveSample], rate: f64) -> (DecayCurve, f64) {
        let n = samples.len() as f64;
        let e: Vec<f64> = samples.iter().map(|s| (-rate * s.t_days).exp()).collect();
        let mean_e = e.iter().sum::<f64>() / n;
        let mean_y = samples.iter().map(|s| s.area_cm2).sum::<f64>() / n;

        let mut cov = 0.0;
        let mut var = 0.0;
        for (ei, s) in e.iter().zip(samples) {
            cov += (ei - mean_e) * (s.area_cm2 - mean_y);
            var += (ei - mean_e).powi(2);
        }

        let (mut floor, mut amplitude) = if var > f64::EPSILON {
            let amplitude = cov / var;
            (mean_y - amplitude * mean_e, amplitude)
        } else {
            (mean_y, 0.0)
        };

        if amplitude < 0.0 {
            // growing data: the best non-increasing curve is flat
            amplitude = 0.0;
            floor = mean_y;
        }
        if floor < 0.0 {
            floor = 0.0;
            let ey: f64 = e.iter().zip(samples).map(|(ei, s)| ei * s.area_cm2).sum();
            let ee: f64 = e.iter().map(|ei| ei * ei).sum();
            amplitude = if ee > 0.0 { (ey / ee).max(0.0) } else { 0.0 };
        }

        let curve = DecayCurve {
            floor,
            amplitude,
            rate,
        };
        (curve, sum_squared_residuals(&curve, samples))
    }
}

impl CurveFitter for ExponentialDecayFitter {
    fn model(&self) -> ForecastModel {
        ForecastModel::ExponentialDecay
    }

    fn fit(&self, samples: &[CurveSample]) -> Result<Box<dyn FittedCurve>, FitError> {
        if samples.len() < MIN_FIT_POINTS {
            return Err(FitError::TooFewSamples {
                required: MIN_FIT_POINTS,
                actual: samples.len(),
            });
        }

        let log_min = self.rate_min.ln();
        let log_max = self.rate_max.ln();
        let step = (log_max - log_min) / (self.grid_steps - 1) as f64;

        let mut best_idx = 0;
        let mut best_sse = f64::INFINITY;
        for i in 0..self.grid_steps {
            let (_, sse) = Self::solve_linear(samples, (log_min + step * i as f64).exp());
            if sse < best_sse {
                best_sse = sse;
                best_idx = i;
            }
        }

        if !best_sse.is_finite() {
            return Err(FitError::NotConverged("residuals are not finite".to_string()));
        }
        if best_idx == self.grid_steps - 1 {
            return Err(FitError::NotConverged(format!(
                "decay rate pinned at the search limit {:.3}/day",
                self.rate_max
            )));
        }

        // Golden-section refinement of ln(rate) around the best grid point
        let inv_phi = (5f64.sqrt() - 1.0) / 2.0;
        let mut lo = log_min + step * best_idx.saturating_sub(1) as f64;
        let mut hi = log_min + step * (best_idx + 1) as f64;
        let sse_at = |log_rate: f64| Self::solve_linear(samples, log_rate.exp()).1;

        let mut c = hi - inv_phi * (hi - lo);
        let mut d = lo + inv_phi * (hi - lo);
        let mut fc = sse_at(c);
        let mut fd = sse_at(d);
        let mut iterations = 0;

        while hi - lo > self.tolerance {
            if iterations == self.max_iterations {
                return Err(FitError::NotConverged(format!(
                    "rate refinement still {:.2e} wide after {} iterations",
                    hi - lo,
                    iterations
                )));
            }
            if fc < fd {
                hi = d;
                d = c;
                fd = fc;
                c = hi - inv_phi * (hi - lo);
                fc = sse_at(c);
            } else {
                lo = c;
                c = d;
                fc = fd;
                d = lo + inv_phi * (hi - lo);
                fd = sse_at(d);
            }
            iterations += 1;
        }

        let (curve, sse) = Self::solve_linear(samples, ((lo + hi) / 2.0).exp());
        let (curve, sse) = if sse <= best_sse {
            (curve, sse)
        } else {
            Self::solve_linear(samples, (log_min + step * best_idx as f64).exp())
        };

        if !(curve.floor.is_finite() && curve.amplitude.is_finite() && sse.is_finite()) {
            return Err(FitError::NotConverged("non-finite parameters".to_string()));
        }

        debug!(
            "Decay fit after {} refinement step(s): floor {:.4}, amplitude {:.4}, rate {:.5}/day, SSE {:.6}",
            iterations, curve.floor, curve.amplitude, curve.rate, sse
        );

        Ok(Box::new(curve))
    }
}

fn sum_squared_residuals(curve: &dyn FittedCurve, samples: &[CurveSample]) -> f64 {
    samples
        .iter()
        .map(|s| (s.area_cm2 - curve.evaluate(s.t_days)).powi(2))
        .sum()
}

/// Forecasts healing trajectories with a pluggable curve fitter
pub struct TrajectoryForecaster {
    config: ForecastConfig,
    fitter: Box<dyn CurveFitter>,
}

impl Default for TrajectoryForecaster {
    fn default() -> Self {
        Self::new(ForecastConfig::default())
    }
}

impl TrajectoryForecaster {
    /// Forecaster using exponential decay
    pub fn new(config: ForecastConfig) -> Self {
        let fitter = ExponentialDecayFitter::from_config(&config);
        Self::with_fitter(config, Box::new(fitter))
    }

    pub fn with_fitter(config: ForecastConfig, fitter: Box<dyn CurveFitter>) -> Self {
        Self { config, fitter }
    }

    pub fn forecast(
        &self,
        history: &HealingHistory,
        horizon: &[DateTime<Utc>],
    ) -> Result<ForecastResult, ForecastError> {
        validate_horizon(history.latest().map(|m| m.timestamp), horizon)?;

        let min_points = self.config.min_points.max(MIN_FIT_POINTS);
        if history.len() < min_points {
            debug!(
                "Wound {}: {} measurement(s), need {} to fit a curve",
                history.wound_id(),
                history.len(),
                min_points
            );
            return Ok(ForecastResult::insufficient());
        }

        let measurements = history.measurements();
        let origin = measurements[0].timestamp;
        let samples: Vec<CurveSample> = measurements
            .iter()
            .map(|m| CurveSample {
                t_days: days_between(origin, m.timestamp),
                area_cm2: m.area_cm2,
            })
            .collect();

        let n = samples.len();
        let last = samples[n - 1];
        let gaps: Vec<f64> = samples.windows(2).map(|w| w[1].t_days - w[0].t_days).collect();
        let mean_gap = mean(&gaps);
        let mean_area = mean(&samples.iter().map(|s| s.area_cm2).collect::<Vec<_>>());

        let (curve, model, fitted) = match self.fitter.fit(&samples) {
            Ok(curve) => (curve, self.fitter.model(), true),
            Err(e) => {
                warn!("Wound {}: {}, falling back to linear extrapolation", history.wound_id(), e);
                let line = LinearCurve::through(samples[n - 2], last);
                (Box::new(line) as Box<dyn FittedCurve>, ForecastModel::LinearFallback, false)
            }
        };

        let sse = sum_squared_residuals(curve.as_ref(), &samples);
        let dof = n.saturating_sub(curve.parameter_count());
        let dof = if dof == 0 { n } else { dof };
        let sigma = (sse / dof as f64)
            .sqrt()
            .max(self.config.min_sigma_fraction * mean_area);

        let model_confidence = if fitted {
            let rel_rmse = if mean_area > 0.0 {
                (sse / n as f64).sqrt() / mean_area
            } else {
                0.0
            };
            let fit_quality = 1.0 / (1.0 + rel_rmse / self.config.residual_reference);
            let regularity = 1.0 / (1.0 + coefficient_of_variation(&gaps));
            (fit_quality * regularity).clamp(0.0, 1.0)
        } else {
            self.config.fallback_confidence
        };

        let predicted_points: Vec<ForecastPoint> = horizon
            .iter()
            .map(|&timestamp| {
                let t = days_between(origin, timestamp);
                let distance = t - last.t_days;
                let area_cm2 = curve.evaluate(t).max(0.0);
                let half_width =
                    self.config.interval_z * sigma * (1.0 + distance / mean_gap).sqrt();
                // Shift up rather than clip at zero so the width stays monotone
                let lower_bound = (area_cm2 - half_width).max(0.0);
                ForecastPoint {
                    timestamp,
                    area_cm2,
                    lower_bound,
                    upper_bound: lower_bound + 2.0 * half_width,
                }
            })
            .collect();

        let projected_closure = curve
            .time_to_reach(self.config.closure_area_cm2, last.t_days)
            .filter(|t| t.is_finite() && *t - last.t_days <= MAX_PROJECTION_DAYS)
            .map(|t| origin + Duration::milliseconds((t * MILLIS_PER_DAY).round() as i64));

        info!(
            "Wound {}: {} forecast over {} point(s), confidence {:.2}",
            history.wound_id(),
            model,
            predicted_points.len(),
            model_confidence
        );

        Ok(ForecastResult {
            predicted_points,
            model_confidence,
            insufficient_data: false,
            model,
            projected_closure,
        })
    }
}

/// Check that `horizon` is strictly increasing and starts after `last_observed`
pub fn validate_horizon(
    last_observed: Option<DateTime<Utc>>,
    horizon: &[DateTime<Utc>],
) -> Result<(), ForecastError> {
    if let Some(index) = (1..horizon.len()).find(|&i| horizon[i] <= horizon[i - 1]) {
        return Err(ForecastError::NonIncreasingHorizon { index });
    }
    if let (Some(first), Some(last_observed)) = (horizon.first(), last_observed) {
        if *first <= last_observed {
            return Err(ForecastError::HorizonNotInFuture {
                first: *first,
                last_observed,
            });
        }
    }
    Ok(())
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_nanoseconds() {
        Some(nanos) => nanos as f64 / NANOS_PER_DAY,
        None => delta.num_milliseconds() as f64 / MILLIS_PER_DAY,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation over mean; zero for perfectly regular sampling
fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m <= 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / m
}
