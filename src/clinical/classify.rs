use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::ClinicalConfig;
use crate::model::{
    AlertStatus, AttributeId, AttributeThreshold, DataId, PatientUuid, RecordingDeviceData, ScheduleWindow,
    ThresholdId, ThresholdKind,
};
use crate::storage::StorageEngine;
use super::threshold::ThresholdTest;
use super::ClinicalError;

/// The outcome of testing one measurement against its threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub threshold_id: Option<ThresholdId>,
    pub threshold_type: Option<ThresholdKind>,
    pub min_value: Option<String>,
    pub max_value: Option<String>,
    pub alert_status: AlertStatus,
}

impl Classification {
    fn without_threshold() -> Self {
        Classification {
            threshold_id: None,
            threshold_type: None,
            min_value: None,
            max_value: None,
            alert_status: AlertStatus::CannotCalculate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedMeasurement {
    #[serde(flatten)]
    pub measurement: RecordingDeviceData,
    #[serde(flatten)]
    pub classification: Classification,
}

/// Resolves the threshold version in force for a measurement and tests the
/// measurement against it
#[derive(Debug, Clone)]
pub struct Classifier {
    storage: Arc<StorageEngine>,
    config: ClinicalConfig,
}

impl Classifier {
    pub fn new(storage: Arc<StorageEngine>, config: &ClinicalConfig) -> Self {
        Classifier {
            storage,
            config: config.clone(),
        }
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn required_attributes(&self) -> &[String] {
        &self.config.required_attributes
    }

    /// The version with the latest effective date not after `at`, or the
    /// earliest version when `at` precedes them all
    pub fn resolve_threshold(
        &self,
        attribute: AttributeId,
        patient: &PatientUuid,
        at: DateTime<Utc>,
    ) -> Result<Option<AttributeThreshold>, ClinicalError> {
        if let Some(effective) = self.storage.effective_threshold(attribute, patient, at)? {
            return Ok(Some(effective));
        }
        Ok(self.storage.earliest_threshold(attribute, patient)?)
    }

    pub fn classify(&self, data: &RecordingDeviceData) -> Result<Classification, ClinicalError> {
        Ok(self.evaluate(data)?.1)
    }

    /// Classification together with the threshold version it was tested
    /// against
    pub fn evaluate(
        &self,
        data: &RecordingDeviceData,
    ) -> Result<(Option<AttributeThreshold>, Classification), ClinicalError> {
        let threshold = match self.resolve_threshold(data.attribute_id, &data.patient_uuid, data.data_value_time)? {
            Some(threshold) => threshold,
            None => {
                debug!(data_id = %data.data_id, patient = %data.patient_uuid, "No threshold configured");
                return Ok((None, Classification::without_threshold()));
            }
        };

        let test = ThresholdTest::new(&threshold, &self.storage, self.config.fewest_change_points);
        let bounds = test.bounds(data)?;
        let alert_status = match bounds {
            Some(bounds) if !bounds.is_complete() => AlertStatus::CannotCalculate,
            _ => match test.test(data)? {
                Some(true) => AlertStatus::InThreshold,
                Some(false) => AlertStatus::OutOfThreshold,
                None => AlertStatus::CannotCalculate,
            },
        };

        let classification = Classification {
            threshold_id: Some(threshold.threshold_id),
            threshold_type: Some(threshold.threshold_type),
            min_value: bounds.and_then(|b| b.min).map(format_bound),
            max_value: bounds.and_then(|b| b.max).map(format_bound),
            alert_status,
        };
        Ok((Some(threshold), classification))
    }

    /// Classify a series ordered oldest first. Only the patient's most
    /// recent measurement of the attribute is checked against its schedule
    /// window, whether or not the series reaches it.
    pub fn classify_series(
        &self,
        series: Vec<RecordingDeviceData>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClassifiedMeasurement>, ClinicalError> {
        let mut latest: HashMap<(PatientUuid, AttributeId), Option<DataId>> = HashMap::new();
        let mut classified = Vec::with_capacity(series.len());

        for measurement in series {
            let key = (measurement.patient_uuid.clone(), measurement.attribute_id);
            let latest_id = match latest.get(&key) {
                Some(id) => *id,
                None => {
                    let id = self.storage
                        .latest_measurement(&measurement.patient_uuid, measurement.attribute_id)?
                        .map(|d| d.data_id);
                    latest.insert(key, id);
                    id
                }
            };

            let mut classification = self.classify(&measurement)?;
            if latest_id == Some(measurement.data_id) {
                if let Some(status) = schedule_override(measurement.schedule(), now) {
                    classification.alert_status = status;
                }
            }
            classified.push(ClassifiedMeasurement { measurement, classification });
        }

        Ok(classified)
    }

    /// Classify a patient's most recent measurement, schedule override
    /// included
    pub fn classify_latest(
        &self,
        measurement: RecordingDeviceData,
        now: DateTime<Utc>,
    ) -> Result<ClassifiedMeasurement, ClinicalError> {
        let mut classification = self.classify(&measurement)?;
        if let Some(status) = schedule_override(measurement.schedule(), now) {
            classification.alert_status = status;
        }
        Ok(ClassifiedMeasurement { measurement, classification })
    }
}

/// Display status for a latest measurement whose schedule window has passed
/// or not yet started
pub fn schedule_override(schedule: ScheduleWindow, now: DateTime<Utc>) -> Option<AlertStatus> {
    if schedule.is_expired(now) {
        Some(AlertStatus::ExpiredMeasurement)
    } else if schedule.is_future(now) {
        Some(AlertStatus::FutureMeasurement)
    } else {
        None
    }
}

/// At most two decimal places, trailing zeros dropped
pub fn format_bound(value: f64) -> String {
    let text = format!("{:.2}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NewMeasurement, NewThreshold};
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    /// Heart rate readings for p-1 with two threshold versions
    fn setup(readings: &[(DateTime<Utc>, &str)]) -> (Classifier, AttributeId) {
        let storage = Arc::new(StorageEngine::in_memory());
        let patient = PatientUuid::new("p-1");

        let mut tx = storage.begin().unwrap();
        let device_type = tx.resolve_or_create_type("BloodPressure", "Omron", "M6", "Blood Pressure Monitor");
        let heart_rate = tx.resolve_or_create_attribute(&device_type, "heart_rate", "BPM", "INTEGER");
        for (effective, low, high) in [(day(2024, 1, 1), "60", "100"), (day(2024, 6, 1), "65", "105")] {
            tx.insert_threshold(NewThreshold {
                attribute_id: heart_rate.attribute_id,
                patient_uuid: patient.clone(),
                threshold_type: ThresholdKind::SimpleInclusiveHighLow,
                threshold_low_value: low.to_string(),
                threshold_high_value: high.to_string(),
                effective_date: effective,
            })
            .unwrap();
        }
        for (time, value) in readings {
            tx.write_if_new(NewMeasurement::new(&heart_rate, &patient, *value, *time));
        }
        tx.commit().unwrap();

        (Classifier::new(storage, &ClinicalConfig::default()), heart_rate.attribute_id)
    }

    #[test]
    fn test_threshold_temporal_selection() {
        let (classifier, heart_rate) = setup(&[]);
        let patient = PatientUuid::new("p-1");

        let march = classifier.resolve_threshold(heart_rate, &patient, day(2024, 3, 1)).unwrap().unwrap();
        assert_eq!((march.threshold_low_value.as_str(), march.threshold_high_value.as_str()), ("60", "100"));

        let july = classifier.resolve_threshold(heart_rate, &patient, day(2024, 7, 1)).unwrap().unwrap();
        assert_eq!((july.threshold_low_value.as_str(), july.threshold_high_value.as_str()), ("65", "105"));

        // Before any threshold: the earliest version applies
        let early = classifier.resolve_threshold(heart_rate, &patient, day(2023, 1, 1)).unwrap().unwrap();
        assert_eq!(early.effective_date, day(2024, 1, 1));
    }

    #[test]
    fn test_out_of_threshold_classification() {
        let (classifier, heart_rate) = setup(&[(day(2024, 7, 1), "110")]);
        let series = classifier.storage()
            .measurements(&PatientUuid::new("p-1"), heart_rate, None, None)
            .unwrap();

        let classification = classifier.classify(&series[0]).unwrap();
        assert_eq!(classification.alert_status, AlertStatus::OutOfThreshold);
        assert_eq!(classification.min_value.as_deref(), Some("65"));
        assert_eq!(classification.max_value.as_deref(), Some("105"));
    }

    #[test]
    fn test_no_threshold_cannot_calculate() {
        let storage = Arc::new(StorageEngine::in_memory());
        let patient = PatientUuid::new("p-2");
        let mut tx = storage.begin().unwrap();
        let device_type = tx.resolve_or_create_type("Scale", "Acme", "W1", "Bathroom Scale");
        let weight = tx.resolve_or_create_attribute(&device_type, "weight", "kg", "DOUBLE");
        tx.write_if_new(NewMeasurement::new(&weight, &patient, "80", day(2024, 1, 1)));
        tx.commit().unwrap();

        let classifier = Classifier::new(storage.clone(), &ClinicalConfig::default());
        let data = storage.measurements(&patient, weight.attribute_id, None, None).unwrap();
        let classification = classifier.classify(&data[0]).unwrap();
        assert_eq!(classification, Classification::without_threshold());
    }

    #[test]
    fn test_expired_override_applies_to_latest_only() {
        let now = Utc::now();
        let storage = Arc::new(StorageEngine::in_memory());
        let patient = PatientUuid::new("p-1");
        let expired = ScheduleWindow {
            effective: Some(now - Duration::days(3)),
            expiry: Some(now - Duration::days(2)),
        };

        let mut tx = storage.begin().unwrap();
        let device_type = tx.resolve_or_create_type("Oximeter", "Contec", "CMS50D+", "Finger Oximeter");
        let spo2 = tx.resolve_or_create_attribute(&device_type, "spo2", "%", "INTEGER");
        tx.insert_threshold(NewThreshold {
            attribute_id: spo2.attribute_id,
            patient_uuid: patient.clone(),
            threshold_type: ThresholdKind::SimpleInclusiveHighLow,
            threshold_low_value: "90".to_string(),
            threshold_high_value: "100".to_string(),
            effective_date: now - Duration::days(30),
        })
        .unwrap();
        for (days_ago, value) in [(4, "97"), (3, "96"), (2, "98")] {
            let measurement = NewMeasurement::new(&spo2, &patient, value, now - Duration::days(days_ago))
                .with_schedule(expired);
            tx.write_if_new(measurement);
        }
        tx.commit().unwrap();

        let classifier = Classifier::new(storage.clone(), &ClinicalConfig::default());
        let series = storage.measurements(&patient, spo2.attribute_id, None, None).unwrap();
        let classified = classifier.classify_series(series, now).unwrap();

        let statuses: Vec<AlertStatus> = classified.iter().map(|c| c.classification.alert_status).collect();
        assert_eq!(statuses, vec![
            AlertStatus::InThreshold,
            AlertStatus::InThreshold,
            AlertStatus::ExpiredMeasurement,
        ]);
    }

    #[test]
    fn test_period_ending_before_latest_gets_no_override() {
        let now = Utc::now();
        let storage = Arc::new(StorageEngine::in_memory());
        let patient = PatientUuid::new("p-1");
        let expired = ScheduleWindow {
            effective: Some(now - Duration::days(5)),
            expiry: Some(now - Duration::days(1)),
        };

        let mut tx = storage.begin().unwrap();
        let device_type = tx.resolve_or_create_type("Oximeter", "Contec", "CMS50D+", "Finger Oximeter");
        let spo2 = tx.resolve_or_create_attribute(&device_type, "spo2", "%", "INTEGER");
        for (hours_ago, value) in [(72, "97"), (48, "96"), (24, "98")] {
            let measurement = NewMeasurement::new(&spo2, &patient, value, now - Duration::hours(hours_ago))
                .with_schedule(expired);
            tx.write_if_new(measurement);
        }
        tx.commit().unwrap();

        let classifier = Classifier::new(storage.clone(), &ClinicalConfig::default());
        let history = storage
            .measurements(&patient, spo2.attribute_id, None, Some(now - Duration::hours(48)))
            .unwrap();
        assert_eq!(history.len(), 2);

        let classified = classifier.classify_series(history, now).unwrap();
        let statuses: Vec<AlertStatus> = classified.iter().map(|c| c.classification.alert_status).collect();
        assert_eq!(statuses, vec![AlertStatus::CannotCalculate, AlertStatus::CannotCalculate]);

        let full = storage.measurements(&patient, spo2.attribute_id, None, None).unwrap();
        let classified = classifier.classify_series(full, now).unwrap();
        assert_eq!(classified[2].classification.alert_status, AlertStatus::ExpiredMeasurement);
    }

    #[test]
    fn test_schedule_override() {
        let now = day(2024, 1, 2);
        let window = ScheduleWindow { effective: Some(day(2024, 1, 3)), expiry: Some(day(2024, 1, 4)) };
        assert_eq!(schedule_override(window, now), Some(AlertStatus::FutureMeasurement));
        assert_eq!(schedule_override(window, day(2024, 1, 5)), Some(AlertStatus::ExpiredMeasurement));
        assert_eq!(schedule_override(ScheduleWindow::default(), now), None);
    }

    #[test]
    fn test_format_bound() {
        assert_eq!(format_bound(65.0), "65");
        assert_eq!(format_bound(78.5), "78.5");
        assert_eq!(format_bound(1.0 / 3.0), "0.33");
        assert_eq!(format_bound(-0.001), "0");
        assert_eq!(format_bound(100.10), "100.1");
    }
}
