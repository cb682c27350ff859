//! Telehealth record types
//!
//! This module contains the records the concentrator keeps for every
//! patient-side device: device types and their attributes (the schema that is
//! discovered from incoming payloads), the measurements themselves, the
//! clinician-set thresholds and the status enums derived from them.

pub mod payload;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceTypeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdId(pub u64);

impl fmt::Display for DeviceTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientUuid(String);

impl PatientUuid {
    pub fn new(uuid: impl Into<String>) -> Self {
        PatientUuid(uuid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatientUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Natural key of a device type: one row per unique combination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceTypeKey {
    pub device_type: String,  // Token taken from the profile id, e.g. "Oximeter"
    pub make: String,
    pub model: String,
    pub display_name: String,
}

/// A class of recording device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingDeviceType {
    pub type_id: DeviceTypeId,
    pub device_type: String,
    pub make: String,
    pub model: String,
    pub display_name: String,
}

impl RecordingDeviceType {
    pub fn key(&self) -> DeviceTypeKey {
        DeviceTypeKey {
            device_type: self.device_type.clone(),
            make: self.make.clone(),
            model: self.model.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// Natural key of an attribute, scoped to its device type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeKey {
    pub type_id: DeviceTypeId,
    pub attribute_name: String,
    pub attribute_units: String,
    pub attribute_type: String,  // The column format token, e.g. "INTEGER"
}

/// A named, unit-typed column belonging to exactly one device type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingDeviceAttribute {
    pub attribute_id: AttributeId,
    pub type_id: DeviceTypeId,
    pub attribute_name: String,
    pub attribute_units: String,
    pub attribute_type: String,
}

impl RecordingDeviceAttribute {
    pub fn key(&self) -> AttributeKey {
        AttributeKey {
            type_id: self.type_id,
            attribute_name: self.attribute_name.clone(),
            attribute_units: self.attribute_units.clone(),
            attribute_type: self.attribute_type.clone(),
        }
    }
}

/// The window within which a scheduled measurement is expected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub effective: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
}

impl ScheduleWindow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.map_or(false, |expiry| now > expiry)
    }

    pub fn is_future(&self, now: DateTime<Utc>) -> bool {
        self.effective.map_or(false, |effective| now < effective)
    }

    /// True only when both ends are known and `now` lies strictly inside
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        match (self.effective, self.expiry) {
            (Some(effective), Some(expiry)) => effective < now && now < expiry,
            _ => false,
        }
    }
}

/// A single stored measurement. Never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingDeviceData {
    pub data_id: DataId,
    pub attribute_id: AttributeId,
    pub patient_uuid: PatientUuid,
    pub data_value: String,
    pub data_value_time: DateTime<Utc>,
    pub schedule_effective_time: Option<DateTime<Utc>>,
    pub schedule_expiry_time: Option<DateTime<Utc>>,
    pub downloaded_time: DateTime<Utc>,
}

impl RecordingDeviceData {
    pub fn schedule(&self) -> ScheduleWindow {
        ScheduleWindow {
            effective: self.schedule_effective_time,
            expiry: self.schedule_expiry_time,
        }
    }

    pub fn dedup_key(&self) -> DataKey {
        DataKey {
            attribute_id: self.attribute_id,
            patient_uuid: self.patient_uuid.clone(),
            data_value: self.data_value.clone(),
            data_value_time: self.data_value_time,
        }
    }
}

/// The tuple that must never be stored twice
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataKey {
    pub attribute_id: AttributeId,
    pub patient_uuid: PatientUuid,
    pub data_value: String,
    pub data_value_time: DateTime<Utc>,
}

/// The closed set of threshold tests a clinician can attach to an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThresholdKind {
    SimpleInclusiveHighLow,   // low <= value <= high
    ChangeOverTime,           // low = period in hours, high = permitted change
    Questionnaire,            // value carries a GREEN_FLAG / RED_FLAG status
}

impl ThresholdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdKind::SimpleInclusiveHighLow => "simple-inclusive-high-low",
            ThresholdKind::ChangeOverTime => "change-over-time",
            ThresholdKind::Questionnaire => "questionnaire",
        }
    }
}

impl Default for ThresholdKind {
    fn default() -> Self {
        ThresholdKind::SimpleInclusiveHighLow
    }
}

impl fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownThresholdKind(pub String);

impl fmt::Display for UnknownThresholdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown threshold type: {}", self.0)
    }
}

impl std::error::Error for UnknownThresholdKind {}

impl FromStr for ThresholdKind {
    type Err = UnknownThresholdKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple-inclusive-high-low" => Ok(ThresholdKind::SimpleInclusiveHighLow),
            "change-over-time" => Ok(ThresholdKind::ChangeOverTime),
            "questionnaire" => Ok(ThresholdKind::Questionnaire),
            other => Err(UnknownThresholdKind(other.to_string())),
        }
    }
}

/// One version of a patient's bounds for an attribute. The version in force
/// for a measurement is the one with the latest effective date not after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeThreshold {
    pub threshold_id: ThresholdId,
    pub attribute_id: AttributeId,
    pub patient_uuid: PatientUuid,
    pub threshold_type: ThresholdKind,
    pub threshold_high_value: String,
    pub threshold_low_value: String,
    pub effective_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub patient_uuid: PatientUuid,
    pub patient_group: Option<String>,
}

/// Classification of one measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    InThreshold,
    OutOfThreshold,
    CannotCalculate,
    ExpiredMeasurement,
    FutureMeasurement,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::InThreshold => "IN_THRESHOLD",
            AlertStatus::OutOfThreshold => "OUT_OF_THRESHOLD",
            AlertStatus::CannotCalculate => "CANNOT_CALCULATE",
            AlertStatus::ExpiredMeasurement => "EXPIRED_MEASUREMENT",
            AlertStatus::FutureMeasurement => "FUTURE_MEASUREMENT",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query-time rollup across a patient's required attributes.
///
/// Declaration order is severity order: the derived `Ord` makes
/// `OutOfThreshold` the maximum. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatientStatus {
    IncompleteSchedule,
    CannotCalculate,
    InThreshold,
    OutOfThreshold,
}

impl PatientStatus {
    /// Expired/future overrides are display-only and carry no severity
    pub fn from_alert(status: AlertStatus) -> Option<Self> {
        match status {
            AlertStatus::InThreshold => Some(PatientStatus::InThreshold),
            AlertStatus::OutOfThreshold => Some(PatientStatus::OutOfThreshold),
            AlertStatus::CannotCalculate => Some(PatientStatus::CannotCalculate),
            AlertStatus::ExpiredMeasurement | AlertStatus::FutureMeasurement => None,
        }
    }
}
