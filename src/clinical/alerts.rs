use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{AlertConfig, AlertTemplates};
use crate::model::{
    AlertStatus, AttributeThreshold, DataId, PatientUuid, RecordingDeviceAttribute, RecordingDeviceData,
    RecordingDeviceType,
};
use super::{Classification, Classifier, ClinicalError};

const DATA_VALUE: &str = "__DATA_VALUE__";
const ATTRIBUTE_UNITS: &str = "__ATTRIBUTE_UNITS__";
const ATTRIBUTE_NAME: &str = "__ATTRIBUTE_NAME__";
const LOWER_LIMIT: &str = "__LOWER_THRESHOLD_LIMIT__";
const UPPER_LIMIT: &str = "__UPPER_THRESHOLD_LIMIT__";
const MEASUREMENT_DATE: &str = "__MEASUREMENT_DATE__";
const MEASUREMENT_PERIOD: &str = "__MEASUREMENT_PERIOD__";
const CHANGE_THRESHOLD: &str = "__MEASUREMENT_CHANGE_THRESHOLD__";
const QUESTIONNAIRE_TYPE: &str = "__QUESTIONNAIRE_TYPE__";

const DISPLAY_FORMAT: &str = "%d/%m/%Y %H:%M";

/// A message for the patient's clinician about one measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub patient_uuid: PatientUuid,
    pub data_id: DataId,
    pub device_type: String,
    pub make: String,
    pub model: String,
    pub attribute_name: String,
    pub data_value: String,
    pub data_value_time: DateTime<Utc>,
    pub status: AlertStatus,
    pub alert_text: String,
    pub alert_time: DateTime<Utc>,
}

/// Everything an alert about one measurement is written from
pub struct AlertSubject<'a> {
    pub data: &'a RecordingDeviceData,
    pub attribute: &'a RecordingDeviceAttribute,
    pub device_type: &'a RecordingDeviceType,
    pub threshold: &'a AttributeThreshold,
    pub classification: &'a Classification,
}

#[derive(Debug, Clone)]
pub struct AlertGenerator {
    config: AlertConfig,
}

impl AlertGenerator {
    pub fn new(config: &AlertConfig) -> Self {
        AlertGenerator { config: config.clone() }
    }

    pub fn sends(&self, status: AlertStatus) -> bool {
        self.config.enabled
            && match status {
                AlertStatus::InThreshold => self.config.send_in_threshold,
                AlertStatus::OutOfThreshold => self.config.send_out_of_threshold,
                AlertStatus::CannotCalculate => self.config.send_cannot_calculate,
                AlertStatus::ExpiredMeasurement | AlertStatus::FutureMeasurement => false,
            }
    }

    /// Build the alert for a classified measurement, if one is due: the
    /// status must be enabled and `now` must lie inside the measurement's
    /// schedule window
    pub fn alert(&self, subject: &AlertSubject<'_>, now: DateTime<Utc>) -> Option<Alert> {
        let status = subject.classification.alert_status;
        if !self.sends(status) {
            return None;
        }
        if !subject.data.schedule().contains(now) {
            debug!(data_id = %subject.data.data_id, "Measurement outside its schedule window, no alert");
            return None;
        }

        let templates = self.config.templates.get(&subject.threshold.threshold_type)?;
        Some(Alert {
            patient_uuid: subject.data.patient_uuid.clone(),
            data_id: subject.data.data_id,
            device_type: subject.device_type.device_type.clone(),
            make: subject.device_type.make.clone(),
            model: subject.device_type.model.clone(),
            attribute_name: subject.attribute.attribute_name.clone(),
            data_value: subject.data.data_value.clone(),
            data_value_time: subject.data.data_value_time,
            status,
            alert_text: render(template_for(templates, status), subject),
            alert_time: now,
        })
    }

    /// Alerts due for the patient's latest measurement of each attribute
    pub fn patient_alerts(
        &self,
        classifier: &Classifier,
        patient: &PatientUuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Alert>, ClinicalError> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        let storage = classifier.storage();
        let mut alerts = Vec::new();
        for data in storage.latest_measurements(patient)? {
            let (threshold, classification) = match classifier.evaluate(&data)? {
                (Some(threshold), classification) => (threshold, classification),
                (None, _) => continue,
            };
            let attribute = match storage.attribute(data.attribute_id)? {
                Some(attribute) => attribute,
                None => continue,
            };
            let device_type = match storage.device_type(attribute.type_id)? {
                Some(device_type) => device_type,
                None => continue,
            };

            let subject = AlertSubject {
                data: &data,
                attribute: &attribute,
                device_type: &device_type,
                threshold: &threshold,
                classification: &classification,
            };
            if let Some(alert) = self.alert(&subject, now) {
                alerts.push(alert);
            }
        }
        Ok(alerts)
    }
}

fn template_for(templates: &AlertTemplates, status: AlertStatus) -> &str {
    match status {
        AlertStatus::InThreshold => &templates.passed,
        AlertStatus::OutOfThreshold => &templates.failed,
        _ => &templates.cannot_calculate,
    }
}

fn render(template: &str, subject: &AlertSubject<'_>) -> String {
    let classification = subject.classification;
    template
        .replace(DATA_VALUE, &subject.data.data_value)
        .replace(ATTRIBUTE_UNITS, &subject.attribute.attribute_units)
        .replace(ATTRIBUTE_NAME, &subject.attribute.attribute_name)
        .replace(LOWER_LIMIT, classification.min_value.as_deref().unwrap_or(&subject.threshold.threshold_low_value))
        .replace(UPPER_LIMIT, classification.max_value.as_deref().unwrap_or(&subject.threshold.threshold_high_value))
        .replace(MEASUREMENT_DATE, &subject.data.data_value_time.format(DISPLAY_FORMAT).to_string())
        .replace(MEASUREMENT_PERIOD, &subject.threshold.threshold_low_value)
        .replace(CHANGE_THRESHOLD, &subject.threshold.threshold_high_value)
        .replace(QUESTIONNAIRE_TYPE, &subject.device_type.display_name)
}
