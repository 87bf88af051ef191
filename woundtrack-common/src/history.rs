use crate::types::{Measurement, WoundId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Violations of the history ordering rules
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HistoryError {
    #[error("two measurements share timestamp {timestamp}")]
    DuplicateTimestamp { timestamp: DateTime<Utc> },

    #[error("measurement at {attempted} is not after the latest entry at {latest}")]
    OutOfOrder {
        latest: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },

    #[error("measurement belongs to wound '{found}', history is for '{expected}'")]
    ForeignMeasurement { expected: WoundId, found: WoundId },
}

/// Time-ascending series of measurements for one wound.
///
/// Timestamps are unique and entries are only ever appended at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawHistory")]
pub struct HealingHistory {
    wound_id: WoundId,
    measurements: Vec<Measurement>,
}

#[derive(Deserialize)]
struct RawHistory {
    wound_id: WoundId,
    measurements: Vec<Measurement>,
}

impl TryFrom<RawHistory> for HealingHistory {
    type Error = HistoryError;

    fn try_from(raw: RawHistory) -> Result<Self, Self::Error> {
        Self::from_measurements(raw.wound_id, raw.measurements)
    }
}

impl HealingHistory {
    pub fn new(wound_id: WoundId) -> Self {
        Self {
            wound_id,
            measurements: Vec::new(),
        }
    }

    /// Build a history from unordered measurements, sorting them by time
    pub fn from_measurements(
        wound_id: WoundId,
        mut measurements: Vec<Measurement>,
    ) -> Result<Self, HistoryError> {
        if let Some(foreign) = measurements.iter().find(|m| m.wound_id != wound_id) {
            return Err(HistoryError::ForeignMeasurement {
                expected: wound_id,
                found: foreign.wound_id.clone(),
            });
        }

        measurements.sort_by_key(|m| m.timestamp);
        if let Some(pair) = measurements
            .windows(2)
            .find(|pair| pair[0].timestamp == pair[1].timestamp)
        {
            return Err(HistoryError::DuplicateTimestamp {
                timestamp: pair[0].timestamp,
            });
        }

        Ok(Self {
            wound_id,
            measurements,
        })
    }

    /// Append a measurement that is strictly newer than every existing entry
    pub fn append(&mut self, measurement: Measurement) -> Result<(), HistoryError> {
        if measurement.wound_id != self.wound_id {
            return Err(HistoryError::ForeignMeasurement {
                expected: self.wound_id.clone(),
                found: measurement.wound_id,
            });
        }
        if let Some(latest) = self.latest() {
            if measurement.timestamp == latest.timestamp {
                return Err(HistoryError::DuplicateTimestamp {
                    timestamp: measurement.timestamp,
                });
            }
            if measurement.timestamp < latest.timestamp {
                return Err(HistoryError::OutOfOrder {
                    latest: latest.timestamp,
                    attempted: measurement.timestamp,
                });
            }
        }
        self.measurements.push(measurement);
        Ok(())
    }

    pub fn wound_id(&self) -> &WoundId {
        &self.wound_id
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn latest(&self) -> Option<&Measurement> {
        self.measurements.last()
    }

    /// The most recent `size` measurements, or all of them if fewer exist
    pub fn window(&self, size: usize) -> &[Measurement] {
        let start = self.measurements.len().saturating_sub(size);
        &self.measurements[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn measurement(wound: &str, day: i64, area: f64) -> Measurement {
        Measurement {
            wound_id: WoundId::from(wound),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap() + Duration::days(day),
            area_cm2: area,
            tissue_fractions: BTreeMap::new(),
            redness_score: 0.0,
            pus_score: 0.0,
            patient_is_diabetic: false,
        }
    }

    #[test]
    fn test_from_measurements_sorts_by_time() {
        let history = HealingHistory::from_measurements(
            WoundId::from("w1"),
            vec![measurement("w1", 14, 3.0), measurement("w1", 0, 5.0), measurement("w1", 7, 4.0)],
        )
        .unwrap();

        let areas: Vec<f64> = history.measurements().iter().map(|m| m.area_cm2).collect();
        assert_eq!(areas, vec![5.0, 4.0, 3.0]);
    }

    #[test]
    fn test_duplicate_timestamps_rejected() {
        let result = HealingHistory::from_measurements(
            WoundId::from("w1"),
            vec![measurement("w1", 0, 5.0), measurement("w1", 0, 4.0)],
        );
        assert!(matches!(result, Err(HistoryError::DuplicateTimestamp { .. })));
    }

    #[test]
    fn test_append_must_move_forward() {
        let mut history = HealingHistory::new(WoundId::from("w1"));
        history.append(measurement("w1", 7, 4.0)).unwrap();

        let err = history.append(measurement("w1", 3, 4.5)).unwrap_err();
        assert!(matches!(err, HistoryError::OutOfOrder { .. }));

        let err = history.append(measurement("w1", 7, 4.5)).unwrap_err();
        assert!(matches!(err, HistoryError::DuplicateTimestamp { .. }));

        history.append(measurement("w1", 14, 3.5)).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_foreign_measurement_rejected() {
        let mut history = HealingHistory::new(WoundId::from("w1"));
        let err = history.append(measurement("w2", 0, 1.0)).unwrap_err();
        assert!(matches!(err, HistoryError::ForeignMeasurement { .. }));
    }

    #[test]
    fn test_window_clamps_to_length() {
        let history = HealingHistory::from_measurements(
            WoundId::from("w1"),
            (0..5).map(|d| measurement("w1", d * 7, 5.0 - d as f64)).collect(),
        )
        .unwrap();
        assert_eq!(history.window(3).len(), 3);
        assert_eq!(history.window(3)[0].area_cm2, 3.0);
        assert_eq!(history.window(10).len(), 5);
    }

    #[test]
    fn test_deserialize_validates_order() {
        let history = HealingHistory::from_measurements(
            WoundId::from("w1"),
            vec![measurement("w1", 0, 5.0), measurement("w1", 7, 4.0)],
        )
        .unwrap();
        let json = serde_json::to_string(&history).unwrap();
        let parsed: HealingHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, history);

        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let first = value["measurements"][0].clone();
        value["measurements"][1] = first;
        assert!(serde_json::from_value::<HealingHistory>(value).is_err());
    }
}
