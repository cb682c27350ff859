use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Patient, PatientStatus, PatientUuid};
use super::{Classifier, ClinicalError};

/// A patient together with their status at query time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientOverview {
    #[serde(flatten)]
    pub patient: Patient,
    pub patient_status: PatientStatus,
}

/// Roll the latest measurement of each required attribute up into one
/// status. The most severe contribution wins; a patient with no required
/// data is `IncompleteSchedule`.
pub fn aggregate_status(
    classifier: &Classifier,
    patient: &PatientUuid,
    now: DateTime<Utc>,
) -> Result<PatientStatus, ClinicalError> {
    let storage = classifier.storage();
    let required = classifier.required_attributes();
    let mut status: Option<PatientStatus> = None;

    for measurement in storage.latest_measurements(patient)? {
        let attribute = match storage.attribute(measurement.attribute_id)? {
            Some(attribute) => attribute,
            None => continue,
        };
        if !required.contains(&attribute.attribute_name) {
            continue;
        }

        let contribution = if measurement.schedule().is_expired(now) {
            Some(PatientStatus::IncompleteSchedule)
        } else {
            PatientStatus::from_alert(classifier.classify(&measurement)?.alert_status)
        };
        status = status.max(contribution);
    }

    Ok(status.unwrap_or(PatientStatus::IncompleteSchedule))
}

/// Every patient, or one group, with their aggregated status
pub fn patient_overviews(
    classifier: &Classifier,
    group: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<PatientOverview>, ClinicalError> {
    classifier.storage()
        .patients(group)?
        .into_iter()
        .map(|patient| {
            let patient_status = aggregate_status(classifier, &patient.patient_uuid, now)?;
            Ok(PatientOverview { patient, patient_status })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClinicalConfig;
    use crate::model::{Patient, RecordingDeviceAttribute, ScheduleWindow, ThresholdKind};
    use crate::storage::{NewMeasurement, NewThreshold, StorageEngine, Transaction};
    use chrono::Duration;
    use std::sync::Arc;

    struct Fixture {
        storage: Arc<StorageEngine>,
        patient: PatientUuid,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            let storage = Arc::new(StorageEngine::in_memory());
            let patient = PatientUuid::new("p-1");
            let mut tx = storage.begin().unwrap();
            tx.register_patient(Patient { patient_uuid: patient.clone(), patient_group: Some("ward-7".to_string()) });
            tx.commit().unwrap();
            Fixture { storage, patient, now: Utc::now() }
        }

        fn current(&self) -> ScheduleWindow {
            ScheduleWindow {
                effective: Some(self.now - Duration::hours(1)),
                expiry: Some(self.now + Duration::hours(1)),
            }
        }

        fn attribute(&self, tx: &mut Transaction<'_>, name: &str, low: &str, high: &str) -> RecordingDeviceAttribute {
            let device_type = tx.resolve_or_create_type("BloodPressure", "Omron", "M6", "Blood Pressure Monitor");
            let attribute = tx.resolve_or_create_attribute(&device_type, name, "unit", "INTEGER");
            tx.insert_threshold(NewThreshold {
                attribute_id: attribute.attribute_id,
                patient_uuid: self.patient.clone(),
                threshold_type: ThresholdKind::SimpleInclusiveHighLow,
                threshold_low_value: low.to_string(),
                threshold_high_value: high.to_string(),
                effective_date: self.now - Duration::days(10),
            })
            .unwrap();
            attribute
        }

        fn classifier(&self) -> Classifier {
            Classifier::new(self.storage.clone(), &ClinicalConfig::default())
        }
    }

    #[test]
    fn test_most_severe_status_wins() {
        let fixture = Fixture::new();
        let mut tx = fixture.storage.begin().unwrap();
        let heart_rate = fixture.attribute(&mut tx, "heart_rate", "60", "100");
        let systolic = fixture.attribute(&mut tx, "systolic_pressure", "90", "140");
        let taken = fixture.now - Duration::minutes(30);
        tx.write_if_new(NewMeasurement::new(&heart_rate, &fixture.patient, "72", taken).with_schedule(fixture.current()));
        tx.write_if_new(NewMeasurement::new(&systolic, &fixture.patient, "180", taken).with_schedule(fixture.current()));
        tx.commit().unwrap();

        let status = aggregate_status(&fixture.classifier(), &fixture.patient, fixture.now).unwrap();
        assert_eq!(status, PatientStatus::OutOfThreshold);
    }

    #[test]
    fn test_expired_schedule_is_incomplete() {
        let fixture = Fixture::new();
        let expired = ScheduleWindow {
            effective: Some(fixture.now - Duration::days(2)),
            expiry: Some(fixture.now - Duration::days(1)),
        };
        let mut tx = fixture.storage.begin().unwrap();
        let heart_rate = fixture.attribute(&mut tx, "heart_rate", "60", "100");
        let taken = fixture.now - Duration::days(2);
        tx.write_if_new(NewMeasurement::new(&heart_rate, &fixture.patient, "72", taken).with_schedule(expired));
        tx.commit().unwrap();

        let status = aggregate_status(&fixture.classifier(), &fixture.patient, fixture.now).unwrap();
        assert_eq!(status, PatientStatus::IncompleteSchedule);
    }

    #[test]
    fn test_only_required_attributes_count() {
        let fixture = Fixture::new();
        let mut tx = fixture.storage.begin().unwrap();
        let heart_rate = fixture.attribute(&mut tx, "heart_rate", "60", "100");
        let weight = fixture.attribute(&mut tx, "weight", "50", "90");
        let taken = fixture.now - Duration::minutes(5);
        tx.write_if_new(NewMeasurement::new(&heart_rate, &fixture.patient, "72", taken).with_schedule(fixture.current()));
        tx.write_if_new(NewMeasurement::new(&weight, &fixture.patient, "140", taken).with_schedule(fixture.current()));
        tx.commit().unwrap();

        let status = aggregate_status(&fixture.classifier(), &fixture.patient, fixture.now).unwrap();
        assert_eq!(status, PatientStatus::InThreshold);
    }

    #[test]
    fn test_no_data_defaults_to_incomplete() {
        let fixture = Fixture::new();
        let overviews = patient_overviews(&fixture.classifier(), Some("ward-7"), fixture.now).unwrap();
        assert_eq!(overviews.len(), 1);
        assert_eq!(overviews[0].patient_status, PatientStatus::IncompleteSchedule);
        assert!(patient_overviews(&fixture.classifier(), Some("ward-9"), fixture.now).unwrap().is_empty());
    }
}
