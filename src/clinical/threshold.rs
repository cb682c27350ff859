//! Threshold tests
//!
//! Every threshold version names one [`ThresholdKind`]. The kind decides how
//! the stored low/high strings are read, which numeric bounds a measurement
//! is shown against and whether the measurement passes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AttributeId, AttributeThreshold, PatientUuid, RecordingDeviceData, ThresholdKind};
use crate::storage::{NewThreshold, StorageEngine};
use super::ClinicalError;

const GREEN_FLAG: &str = "GREEN_FLAG";
const RED_FLAG: &str = "RED_FLAG";

/// Numeric bounds for one measurement. A missing side could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ThresholdBounds {
    pub fn is_complete(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }
}

/// Check that the low/high strings make sense for the kind
pub fn validate_values(kind: ThresholdKind, low: &str, high: &str) -> Result<(), ClinicalError> {
    match kind {
        ThresholdKind::SimpleInclusiveHighLow => {
            let (low, high) = match (parse_number(low), parse_number(high)) {
                (Some(low), Some(high)) => (low, high),
                _ => {
                    return Err(ClinicalError::InvalidThreshold(
                        "low and high values must be numbers".to_string(),
                    ));
                }
            };
            if low > high {
                return Err(ClinicalError::InvalidThreshold(
                    "low value must not exceed high value".to_string(),
                ));
            }
        }
        ThresholdKind::ChangeOverTime => {
            match low.trim().parse::<i64>() {
                Ok(hours) if hours > 0 => {}
                _ => {
                    return Err(ClinicalError::InvalidThreshold(
                        "low value must be a whole, positive number of hours".to_string(),
                    ));
                }
            }
            if parse_number(high).is_none() {
                return Err(ClinicalError::InvalidThreshold(
                    "high value must be the permitted change".to_string(),
                ));
            }
        }
        ThresholdKind::Questionnaire => {}
    }
    Ok(())
}

/// A clinician's request for a new threshold version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRequest {
    pub attribute_id: AttributeId,
    pub patient_uuid: PatientUuid,
    pub threshold_type: String,
    pub threshold_low_value: String,
    pub threshold_high_value: String,
    pub effective_date: DateTime<Utc>,
}

/// Validate and store a new threshold version
pub fn create_threshold(storage: &StorageEngine, request: ThresholdRequest) -> Result<AttributeThreshold, ClinicalError> {
    let kind: ThresholdKind = request.threshold_type.parse()?;
    validate_values(kind, &request.threshold_low_value, &request.threshold_high_value)?;
    if storage.attribute(request.attribute_id)?.is_none() {
        return Err(ClinicalError::UnknownAttribute(request.attribute_id));
    }

    let mut tx = storage.begin()?;
    let created = tx.insert_threshold(NewThreshold {
        attribute_id: request.attribute_id,
        patient_uuid: request.patient_uuid,
        threshold_type: kind,
        threshold_low_value: request.threshold_low_value,
        threshold_high_value: request.threshold_high_value,
        effective_date: request.effective_date,
    })?;
    tx.commit()?;
    Ok(created)
}

/// One threshold version, ready to test measurements against
pub struct ThresholdTest<'a> {
    threshold: &'a AttributeThreshold,
    storage: &'a StorageEngine,
    fewest_points: usize,
}

impl<'a> ThresholdTest<'a> {
    pub fn new(threshold: &'a AttributeThreshold, storage: &'a StorageEngine, fewest_points: usize) -> Self {
        ThresholdTest {
            threshold,
            storage,
            fewest_points: fewest_points.max(2),
        }
    }

    pub fn kind(&self) -> ThresholdKind {
        self.threshold.threshold_type
    }

    /// Bounds the measurement is judged against. `None` for kinds without
    /// numeric bounds.
    pub fn bounds(&self, data: &RecordingDeviceData) -> Result<Option<ThresholdBounds>, ClinicalError> {
        match self.kind() {
            ThresholdKind::SimpleInclusiveHighLow => Ok(Some(ThresholdBounds {
                min: parse_number(&self.threshold.threshold_low_value),
                max: parse_number(&self.threshold.threshold_high_value),
            })),
            ThresholdKind::ChangeOverTime => {
                let change = parse_number(&self.threshold.threshold_high_value);
                let bounds = match (self.predict(data)?, change) {
                    (Some(predicted), Some(change)) => ThresholdBounds {
                        min: Some(predicted - change),
                        max: Some(predicted + change),
                    },
                    _ => {
                        let value = parse_number(&data.data_value);
                        ThresholdBounds { min: value, max: value }
                    }
                };
                Ok(Some(bounds))
            }
            ThresholdKind::Questionnaire => Ok(None),
        }
    }

    /// `Some(true)` in threshold, `Some(false)` out, `None` when the test
    /// cannot be calculated
    pub fn test(&self, data: &RecordingDeviceData) -> Result<Option<bool>, ClinicalError> {
        match self.kind() {
            ThresholdKind::SimpleInclusiveHighLow => {
                let value = parse_number(&data.data_value);
                let low = parse_number(&self.threshold.threshold_low_value);
                let high = parse_number(&self.threshold.threshold_high_value);
                Ok(match (value, low, high) {
                    (Some(value), Some(low), Some(high)) => Some(low <= value && value <= high),
                    _ => None,
                })
            }
            ThresholdKind::ChangeOverTime => {
                let value = parse_number(&data.data_value);
                let change = parse_number(&self.threshold.threshold_high_value);
                let predicted = self.predict(data)?;
                Ok(match (value, change, predicted) {
                    (Some(value), Some(change), Some(predicted)) => {
                        Some(value < predicted + change && value > predicted - change)
                    }
                    _ => None,
                })
            }
            ThresholdKind::Questionnaire => Ok(questionnaire_flag(&data.data_value)),
        }
    }

    /// Period in hours over which change is measured
    pub fn period_hours(&self) -> Option<i64> {
        match self.kind() {
            ThresholdKind::ChangeOverTime => self.threshold.threshold_low_value.trim().parse().ok(),
            _ => None,
        }
    }

    /// Least-squares estimate of the value expected at the measurement's
    /// time, from the readings over the threshold period
    fn predict(&self, data: &RecordingDeviceData) -> Result<Option<f64>, ClinicalError> {
        let hours = match self.period_hours() {
            Some(hours) if hours > 0 => hours,
            _ => return Ok(None),
        };
        let at = data.data_value_time;
        let period_start = match Duration::try_hours(hours).and_then(|period| at.checked_sub_signed(period)) {
            Some(start) => start,
            None => return Ok(None),
        };

        // The series must reach back at least a full period
        let anchor = match self.storage.latest_at_or_before(&data.patient_uuid, data.attribute_id, period_start)? {
            Some(anchor) => anchor,
            None => return Ok(None),
        };

        let history = self.storage.measurements(
            &data.patient_uuid,
            data.attribute_id,
            Some(anchor.data_value_time),
            Some(at),
        )?;

        let mut points = Vec::with_capacity(history.len());
        for reading in &history {
            match parse_number(&reading.data_value) {
                Some(value) => points.push((offset_seconds(anchor.data_value_time, reading.data_value_time), value)),
                None => return Ok(None),
            }
        }
        if points.len() < self.fewest_points {
            return Ok(None);
        }

        Ok(least_squares(&points).map(|(slope, intercept)| {
            slope * offset_seconds(anchor.data_value_time, at) + intercept
        }))
    }
}

fn offset_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Fit `y = slope * x + intercept`. `None` when every x is the same.
pub fn least_squares(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;

    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let numerator: f64 = points.iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();

    let denominator: f64 = points.iter()
        .map(|(x, _)| (x - mean_x).powi(2))
        .sum();

    if denominator == 0.0 {
        return None;
    }

    let slope = numerator / denominator;
    Some((slope, mean_y - slope * mean_x))
}

fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn questionnaire_flag(value: &str) -> Option<bool> {
    let parsed: serde_json::Value = serde_json::from_str(value).ok()?;
    match parsed.get("status").and_then(|s| s.as_str()) {
        Some(GREEN_FLAG) => Some(true),
        Some(RED_FLAG) => Some(false),
        _ => None,
    }
}
