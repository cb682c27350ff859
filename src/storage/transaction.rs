use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLockWriteGuard;
use tracing::debug;

use crate::model::{
    AttributeId, AttributeKey, AttributeThreshold, DataId, DataKey, DeviceTypeId, DeviceTypeKey,
    Patient, PatientUuid, RecordingDeviceAttribute, RecordingDeviceData, RecordingDeviceType,
    ScheduleWindow, ThresholdId, ThresholdKind,
};
use super::{PersistenceManager, StorageError, Tables, WalEntry};

/// A measurement waiting to be written
#[derive(Debug, Clone)]
pub struct NewMeasurement {
    pub attribute_id: AttributeId,
    pub patient_uuid: PatientUuid,
    pub data_value: String,
    pub data_value_time: DateTime<Utc>,
    pub schedule: ScheduleWindow,
}

impl NewMeasurement {
    pub fn new(
        attribute: &RecordingDeviceAttribute,
        patient: &PatientUuid,
        value: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        NewMeasurement {
            attribute_id: attribute.attribute_id,
            patient_uuid: patient.clone(),
            data_value: value.into(),
            data_value_time: time,
            schedule: ScheduleWindow::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: ScheduleWindow) -> Self {
        self.schedule = schedule;
        self
    }

    fn key(&self) -> DataKey {
        DataKey {
            attribute_id: self.attribute_id,
            patient_uuid: self.patient_uuid.clone(),
            data_value: self.data_value.clone(),
            data_value_time: self.data_value_time,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewThreshold {
    pub attribute_id: AttributeId,
    pub patient_uuid: PatientUuid,
    pub threshold_type: ThresholdKind,
    pub threshold_low_value: String,
    pub threshold_high_value: String,
    pub effective_date: DateTime<Utc>,
}

/// A unit of work against the storage engine.
///
/// Holds the engine's write lock, so there is at most one open transaction.
/// Changes are staged and only become visible on [`Transaction::commit`];
/// dropping the transaction discards them.
pub struct Transaction<'a> {
    tables: RwLockWriteGuard<'a, Tables>,
    persistence: Option<&'a PersistenceManager>,
    staged: Vec<WalEntry>,
    staged_types: HashMap<DeviceTypeKey, RecordingDeviceType>,
    staged_attributes: HashMap<AttributeKey, RecordingDeviceAttribute>,
    staged_data: HashSet<DataKey>,
    staged_patients: HashSet<PatientUuid>,
    staged_thresholds: u64,
    rows_written: usize,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(tables: RwLockWriteGuard<'a, Tables>, persistence: Option<&'a PersistenceManager>) -> Self {
        Transaction {
            tables,
            persistence,
            staged: Vec::new(),
            staged_types: HashMap::new(),
            staged_attributes: HashMap::new(),
            staged_data: HashSet::new(),
            staged_patients: HashSet::new(),
            staged_thresholds: 0,
            rows_written: 0,
        }
    }

    /// Look up a device type by its natural key, creating it when unknown
    pub fn resolve_or_create_type(
        &mut self,
        device_type: &str,
        make: &str,
        model: &str,
        display_name: &str,
    ) -> RecordingDeviceType {
        let key = DeviceTypeKey {
            device_type: device_type.to_string(),
            make: make.to_string(),
            model: model.to_string(),
            display_name: display_name.to_string(),
        };
        if let Some(existing) = self.tables.device_type_by_key(&key) {
            return existing.clone();
        }
        if let Some(existing) = self.staged_types.get(&key) {
            return existing.clone();
        }

        let created = RecordingDeviceType {
            type_id: DeviceTypeId(self.tables.next_type_id() + self.staged_types.len() as u64),
            device_type: key.device_type.clone(),
            make: key.make.clone(),
            model: key.model.clone(),
            display_name: key.display_name.clone(),
        };
        debug!(type_id = %created.type_id, device_type, make, model, "Registering device type");
        self.staged.push(WalEntry::DeviceType(created.clone()));
        self.staged_types.insert(key, created.clone());
        created
    }

    /// Look up an attribute of `device_type` by its natural key, creating it
    /// when unknown
    pub fn resolve_or_create_attribute(
        &mut self,
        device_type: &RecordingDeviceType,
        name: &str,
        units: &str,
        attribute_type: &str,
    ) -> RecordingDeviceAttribute {
        let key = AttributeKey {
            type_id: device_type.type_id,
            attribute_name: name.to_string(),
            attribute_units: units.to_string(),
            attribute_type: attribute_type.to_string(),
        };
        if let Some(existing) = self.tables.attribute_by_key(&key) {
            return existing.clone();
        }
        if let Some(existing) = self.staged_attributes.get(&key) {
            return existing.clone();
        }

        let created = RecordingDeviceAttribute {
            attribute_id: AttributeId(self.tables.next_attribute_id() + self.staged_attributes.len() as u64),
            type_id: key.type_id,
            attribute_name: key.attribute_name.clone(),
            attribute_units: key.attribute_units.clone(),
            attribute_type: key.attribute_type.clone(),
        };
        debug!(attribute_id = %created.attribute_id, type_id = %created.type_id, name, "Registering attribute");
        self.staged.push(WalEntry::Attribute(created.clone()));
        self.staged_attributes.insert(key, created.clone());
        created
    }

    /// Store the measurement unless an identical one already exists.
    /// Returns whether a row was written.
    pub fn write_if_new(&mut self, measurement: NewMeasurement) -> bool {
        let key = measurement.key();
        if self.tables.is_stored(&key) || self.staged_data.contains(&key) {
            return false;
        }

        let data = RecordingDeviceData {
            data_id: DataId(self.tables.next_data_id() + self.rows_written as u64),
            attribute_id: measurement.attribute_id,
            patient_uuid: measurement.patient_uuid,
            data_value: measurement.data_value,
            data_value_time: measurement.data_value_time,
            schedule_effective_time: measurement.schedule.effective,
            schedule_expiry_time: measurement.schedule.expiry,
            downloaded_time: Utc::now(),
        };
        self.staged.push(WalEntry::Data(data));
        self.staged_data.insert(key);
        self.rows_written += 1;
        true
    }

    /// Register the patient with no group if they are not yet known
    pub fn ensure_patient(&mut self, uuid: &PatientUuid) {
        if self.tables.has_patient(uuid) || self.staged_patients.contains(uuid) {
            return;
        }
        self.register_patient(Patient {
            patient_uuid: uuid.clone(),
            patient_group: None,
        });
    }

    /// Insert or replace a patient record
    pub fn register_patient(&mut self, patient: Patient) {
        self.staged_patients.insert(patient.patient_uuid.clone());
        self.staged.push(WalEntry::Patient(patient));
    }

    /// Add a new threshold version. Earlier versions are kept.
    pub fn insert_threshold(&mut self, threshold: NewThreshold) -> Result<AttributeThreshold, StorageError> {
        let known = self.tables.attribute(threshold.attribute_id).is_some()
            || self.staged_attributes.values().any(|a| a.attribute_id == threshold.attribute_id);
        if !known {
            return Err(StorageError::UnknownAttribute(threshold.attribute_id));
        }

        let created = AttributeThreshold {
            threshold_id: ThresholdId(self.tables.next_threshold_id() + self.staged_thresholds),
            attribute_id: threshold.attribute_id,
            patient_uuid: threshold.patient_uuid,
            threshold_type: threshold.threshold_type,
            threshold_high_value: threshold.threshold_high_value,
            threshold_low_value: threshold.threshold_low_value,
            effective_date: threshold.effective_date,
        };
        self.staged.push(WalEntry::Threshold(created.clone()));
        self.staged_thresholds += 1;
        Ok(created)
    }

    /// Measurements staged so far
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Log the staged changes and make them visible. Returns the number of
    /// measurements written.
    pub fn commit(mut self) -> Result<usize, StorageError> {
        if self.staged.is_empty() {
            return Ok(0);
        }

        if let Some(persistence) = self.persistence {
            persistence.append(&self.staged)?;
        }

        let staged = std::mem::take(&mut self.staged);
        debug!(entries = staged.len(), rows = self.rows_written, "Committing transaction");
        for entry in staged {
            self.tables.apply(entry);
        }
        Ok(self.rows_written)
    }

    pub fn rollback(self) {
        debug!(entries = self.staged.len(), "Rolling back transaction");
    }
}
