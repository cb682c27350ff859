//! Core storage engine
//!
//! Handles the fundamental storage operations including:
//! - The device type / attribute registry with unique natural keys
//! - Measurement and threshold tables with per-(patient, attribute) indexes
//! - Single-writer transactions with write-ahead logging
//!
//! Readers take the read lock and get owned copies back; all writes go
//! through a [`Transaction`].

mod persistence;
mod transaction;

pub use persistence::{PersistenceManager, WalEntry};
pub use transaction::{NewMeasurement, NewThreshold, Transaction};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::info;

use crate::config::StorageConfig;
use crate::model::{
    AttributeId, AttributeKey, AttributeThreshold, DataKey, DeviceTypeId, DeviceTypeKey, Patient,
    PatientUuid, RecordingDeviceAttribute, RecordingDeviceData, RecordingDeviceType,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Storage lock poisoned")]
    Poisoned,
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(AttributeId),
    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),
}

/// Row tables. Ids are dense: row `n` of a table has id `n + 1`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Tables {
    device_types: Vec<RecordingDeviceType>,
    attributes: Vec<RecordingDeviceAttribute>,
    data: Vec<RecordingDeviceData>,
    thresholds: Vec<AttributeThreshold>,
    patients: Vec<Patient>,
    #[serde(skip)]
    index: Index,
}

#[derive(Debug, Default)]
struct Index {
    device_types: HashMap<DeviceTypeKey, DeviceTypeId>,
    attributes: HashMap<AttributeKey, AttributeId>,
    stored: HashSet<DataKey>,
    series: HashMap<(PatientUuid, AttributeId), Vec<usize>>,
    thresholds: HashMap<(PatientUuid, AttributeId), Vec<usize>>,
    patients: HashMap<PatientUuid, usize>,
}

impl Tables {
    /// Apply one logged row. Rows whose id is already present are skipped,
    /// so a frame that made it into a snapshot can be replayed safely.
    pub(crate) fn apply(&mut self, entry: WalEntry) {
        match entry {
            WalEntry::DeviceType(device_type) => {
                if device_type.type_id.0 < self.next_type_id() {
                    return;
                }
                self.index.device_types.insert(device_type.key(), device_type.type_id);
                self.device_types.push(device_type);
            }
            WalEntry::Attribute(attribute) => {
                if attribute.attribute_id.0 < self.next_attribute_id() {
                    return;
                }
                self.index.attributes.insert(attribute.key(), attribute.attribute_id);
                self.attributes.push(attribute);
            }
            WalEntry::Data(data) => {
                if data.data_id.0 < self.next_data_id() {
                    return;
                }
                self.index.stored.insert(data.dedup_key());
                self.index.series
                    .entry((data.patient_uuid.clone(), data.attribute_id))
                    .or_insert_with(Vec::new)
                    .push(self.data.len());
                self.data.push(data);
            }
            WalEntry::Threshold(threshold) => {
                if threshold.threshold_id.0 < self.next_threshold_id() {
                    return;
                }
                self.index.thresholds
                    .entry((threshold.patient_uuid.clone(), threshold.attribute_id))
                    .or_insert_with(Vec::new)
                    .push(self.thresholds.len());
                self.thresholds.push(threshold);
            }
            WalEntry::Patient(patient) => {
                match self.index.patients.get(&patient.patient_uuid) {
                    Some(&pos) => self.patients[pos] = patient,
                    None => {
                        self.index.patients.insert(patient.patient_uuid.clone(), self.patients.len());
                        self.patients.push(patient);
                    }
                }
            }
        }
    }

    /// Indexes are not serialized; rebuild them after loading a snapshot
    fn rebuild_index(&mut self) {
        let device_types = std::mem::take(&mut self.device_types);
        let attributes = std::mem::take(&mut self.attributes);
        let data = std::mem::take(&mut self.data);
        let thresholds = std::mem::take(&mut self.thresholds);
        let patients = std::mem::take(&mut self.patients);
        self.index = Index::default();

        let entries = device_types.into_iter().map(WalEntry::DeviceType)
            .chain(attributes.into_iter().map(WalEntry::Attribute))
            .chain(data.into_iter().map(WalEntry::Data))
            .chain(thresholds.into_iter().map(WalEntry::Threshold))
            .chain(patients.into_iter().map(WalEntry::Patient));
        for entry in entries {
            self.apply(entry);
        }
    }

    fn next_type_id(&self) -> u64 {
        self.device_types.len() as u64 + 1
    }

    fn next_attribute_id(&self) -> u64 {
        self.attributes.len() as u64 + 1
    }

    fn next_data_id(&self) -> u64 {
        self.data.len() as u64 + 1
    }

    fn next_threshold_id(&self) -> u64 {
        self.thresholds.len() as u64 + 1
    }

    fn device_type_by_key(&self, key: &DeviceTypeKey) -> Option<&RecordingDeviceType> {
        self.index.device_types.get(key).and_then(|id| self.device_type(*id))
    }

    fn device_type(&self, id: DeviceTypeId) -> Option<&RecordingDeviceType> {
        (id.0 as usize).checked_sub(1).and_then(|pos| self.device_types.get(pos))
    }

    fn attribute_by_key(&self, key: &AttributeKey) -> Option<&RecordingDeviceAttribute> {
        self.index.attributes.get(key).and_then(|id| self.attribute(*id))
    }

    fn attribute(&self, id: AttributeId) -> Option<&RecordingDeviceAttribute> {
        (id.0 as usize).checked_sub(1).and_then(|pos| self.attributes.get(pos))
    }

    fn is_stored(&self, key: &DataKey) -> bool {
        self.index.stored.contains(key)
    }

    fn has_patient(&self, uuid: &PatientUuid) -> bool {
        self.index.patients.contains_key(uuid)
    }

    fn series(&self, patient: &PatientUuid, attribute: AttributeId) -> impl Iterator<Item = &RecordingDeviceData> {
        self.index.series
            .get(&(patient.clone(), attribute))
            .into_iter()
            .flatten()
            .map(move |&pos| &self.data[pos])
    }

    fn thresholds_for(&self, patient: &PatientUuid, attribute: AttributeId) -> impl Iterator<Item = &AttributeThreshold> {
        self.index.thresholds
            .get(&(patient.clone(), attribute))
            .into_iter()
            .flatten()
            .map(move |&pos| &self.thresholds[pos])
    }
}

#[derive(Debug)]
pub struct StorageEngine {
    tables: RwLock<Tables>,
    persistence: Option<PersistenceManager>,
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl StorageEngine {
    pub fn in_memory() -> Self {
        StorageEngine {
            tables: RwLock::new(Tables::default()),
            persistence: None,
        }
    }

    /// Open the engine, recovering from snapshot and write-ahead log when a
    /// storage path is configured
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        let path = match &config.path {
            Some(path) => path,
            None => return Ok(Self::in_memory()),
        };

        let persistence = PersistenceManager::new(path)
            .map_err(|e| StorageError::Persistence(format!("Failed to open {}: {}", path.display(), e)))?;
        let tables = persistence.load()?;

        info!(
            path = %path.display(),
            device_types = tables.device_types.len(),
            measurements = tables.data.len(),
            "Recovered storage"
        );

        Ok(StorageEngine {
            tables: RwLock::new(tables),
            persistence: Some(persistence),
        })
    }

    /// Start a write transaction. Writers are serialized; the transaction
    /// holds the write lock until it is committed or dropped.
    pub fn begin(&self) -> Result<Transaction<'_>, StorageError> {
        let guard = self.write()?;
        Ok(Transaction::new(guard, self.persistence.as_ref()))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StorageError> {
        self.tables.read().map_err(|_| StorageError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StorageError> {
        self.tables.write().map_err(|_| StorageError::Poisoned)
    }

    pub fn find_device_type(&self, key: &DeviceTypeKey) -> Result<Option<RecordingDeviceType>, StorageError> {
        Ok(self.read()?.device_type_by_key(key).cloned())
    }

    pub fn find_attribute(&self, key: &AttributeKey) -> Result<Option<RecordingDeviceAttribute>, StorageError> {
        Ok(self.read()?.attribute_by_key(key).cloned())
    }

    pub fn device_type(&self, id: DeviceTypeId) -> Result<Option<RecordingDeviceType>, StorageError> {
        Ok(self.read()?.device_type(id).cloned())
    }

    pub fn attribute(&self, id: AttributeId) -> Result<Option<RecordingDeviceAttribute>, StorageError> {
        Ok(self.read()?.attribute(id).cloned())
    }

    pub fn device_types(&self) -> Result<Vec<RecordingDeviceType>, StorageError> {
        Ok(self.read()?.device_types.clone())
    }

    pub fn attributes(&self) -> Result<Vec<RecordingDeviceAttribute>, StorageError> {
        Ok(self.read()?.attributes.clone())
    }

    pub fn measurement_count(&self) -> Result<usize, StorageError> {
        Ok(self.read()?.data.len())
    }

    /// Measurements for a patient and attribute, oldest first, optionally
    /// limited to `from <= data_value_time <= to`
    pub fn measurements(
        &self,
        patient: &PatientUuid,
        attribute: AttributeId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecordingDeviceData>, StorageError> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(StorageError::InvalidTimeRange(
                    "Start time must not be after end time".to_string()
                ));
            }
        }

        let tables = self.read()?;
        let mut results: Vec<RecordingDeviceData> = tables.series(patient, attribute)
            .filter(|d| from.map_or(true, |from| d.data_value_time >= from))
            .filter(|d| to.map_or(true, |to| d.data_value_time <= to))
            .cloned()
            .collect();

        // Stable: equal times keep insertion order
        results.sort_by_key(|d| d.data_value_time);
        Ok(results)
    }

    /// The most recent reading at or before `at`
    pub fn latest_at_or_before(
        &self,
        patient: &PatientUuid,
        attribute: AttributeId,
        at: DateTime<Utc>,
    ) -> Result<Option<RecordingDeviceData>, StorageError> {
        let tables = self.read()?;
        let latest = tables.series(patient, attribute)
            .filter(|d| d.data_value_time <= at)
            .fold(None, |latest: Option<&RecordingDeviceData>, d| match latest {
                Some(l) if l.data_value_time > d.data_value_time => Some(l),
                _ => Some(d),
            });
        Ok(latest.cloned())
    }

    /// The patient's most recent reading of one attribute. Ties on time go to
    /// the later insert.
    pub fn latest_measurement(
        &self,
        patient: &PatientUuid,
        attribute: AttributeId,
    ) -> Result<Option<RecordingDeviceData>, StorageError> {
        let tables = self.read()?;
        let latest = tables.series(patient, attribute)
            .fold(None, |latest: Option<&RecordingDeviceData>, d| match latest {
                Some(l) if l.data_value_time > d.data_value_time => Some(l),
                _ => Some(d),
            });
        Ok(latest.cloned())
    }

    /// Latest measurement per attribute for a patient, ordered by device type
    /// then attribute. Ties on time go to the later insert.
    pub fn latest_measurements(&self, patient: &PatientUuid) -> Result<Vec<RecordingDeviceData>, StorageError> {
        let tables = self.read()?;
        let mut latest: Vec<(DeviceTypeId, RecordingDeviceData)> = Vec::new();

        for ((uuid, attribute_id), positions) in &tables.index.series {
            if uuid != patient {
                continue;
            }
            let newest = positions.iter()
                .map(|&pos| &tables.data[pos])
                .fold(None, |newest: Option<&RecordingDeviceData>, d| match newest {
                    Some(n) if n.data_value_time > d.data_value_time => Some(n),
                    _ => Some(d),
                });
            if let Some(data) = newest {
                let type_id = tables.attribute(*attribute_id)
                    .map(|a| a.type_id)
                    .unwrap_or(DeviceTypeId(0));
                latest.push((type_id, data.clone()));
            }
        }

        latest.sort_by_key(|(type_id, d)| (*type_id, d.attribute_id));
        Ok(latest.into_iter().map(|(_, d)| d).collect())
    }

    /// Attributes that hold data for the patient, optionally restricted to
    /// the given names (empty means all), ordered by attribute id
    pub fn attributes_with_data(
        &self,
        patient: &PatientUuid,
        names: &[String],
    ) -> Result<Vec<RecordingDeviceAttribute>, StorageError> {
        let tables = self.read()?;
        let mut attributes: Vec<RecordingDeviceAttribute> = tables.index.series
            .iter()
            .filter(|((uuid, _), positions)| uuid == patient && !positions.is_empty())
            .filter_map(|((_, attribute_id), _)| tables.attribute(*attribute_id))
            .filter(|a| names.is_empty() || names.contains(&a.attribute_name))
            .cloned()
            .collect();
        attributes.sort_by_key(|a| a.attribute_id);
        Ok(attributes)
    }

    /// Threshold versions for a patient and attribute, oldest first
    pub fn thresholds(
        &self,
        patient: &PatientUuid,
        attribute: AttributeId,
    ) -> Result<Vec<AttributeThreshold>, StorageError> {
        let tables = self.read()?;
        let mut thresholds: Vec<AttributeThreshold> = tables.thresholds_for(patient, attribute).cloned().collect();
        thresholds.sort_by_key(|t| t.effective_date);
        Ok(thresholds)
    }

    /// The version with the latest effective date not after `at`. Among
    /// versions sharing that date the last one created wins.
    pub fn effective_threshold(
        &self,
        attribute: AttributeId,
        patient: &PatientUuid,
        at: DateTime<Utc>,
    ) -> Result<Option<AttributeThreshold>, StorageError> {
        let tables = self.read()?;
        let effective = tables.thresholds_for(patient, attribute)
            .filter(|t| t.effective_date <= at)
            .fold(None, |best: Option<&AttributeThreshold>, t| match best {
                Some(b) if b.effective_date > t.effective_date => Some(b),
                _ => Some(t),
            });
        Ok(effective.cloned())
    }

    /// The first version ever configured for the patient and attribute
    pub fn earliest_threshold(
        &self,
        attribute: AttributeId,
        patient: &PatientUuid,
    ) -> Result<Option<AttributeThreshold>, StorageError> {
        let tables = self.read()?;
        let earliest = tables.thresholds_for(patient, attribute)
            .fold(None, |best: Option<&AttributeThreshold>, t| match best {
                Some(b) if b.effective_date <= t.effective_date => Some(b),
                _ => Some(t),
            });
        Ok(earliest.cloned())
    }

    pub fn patient(&self, uuid: &PatientUuid) -> Result<Option<Patient>, StorageError> {
        let tables = self.read()?;
        Ok(tables.index.patients.get(uuid).map(|&pos| tables.patients[pos].clone()))
    }

    /// All patients, or only those in `group`
    pub fn patients(&self, group: Option<&str>) -> Result<Vec<Patient>, StorageError> {
        let tables = self.read()?;
        Ok(tables.patients
            .iter()
            .filter(|p| group.map_or(true, |g| p.patient_group.as_deref() == Some(g)))
            .cloned()
            .collect())
    }

    /// Write a snapshot and truncate the write-ahead log
    pub fn flush_all(&self) -> Result<(), StorageError> {
        match &self.persistence {
            Some(persistence) => {
                let tables = self.read()?;
                persistence.save_snapshot(&tables)
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ThresholdKind;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn oximeter(tx: &mut Transaction<'_>) -> RecordingDeviceAttribute {
        let device_type = tx.resolve_or_create_type("Oximeter", "Contec", "CMS50D+", "Finger Oximeter");
        tx.resolve_or_create_attribute(&device_type, "spo2", "%", "INTEGER")
    }

    #[test]
    fn test_basic_operations() {
        let storage = StorageEngine::in_memory();
        let patient = PatientUuid::new("p-1");

        let mut tx = storage.begin().unwrap();
        let spo2 = oximeter(&mut tx);
        tx.ensure_patient(&patient);
        assert!(tx.write_if_new(NewMeasurement::new(&spo2, &patient, "98", at(2024, 1, 1))));
        assert!(tx.write_if_new(NewMeasurement::new(&spo2, &patient, "97", at(2024, 1, 2))));
        assert_eq!(tx.commit().unwrap(), 2);

        let series = storage.measurements(&patient, spo2.attribute_id, None, None).unwrap();
        assert_eq!(series.iter().map(|d| d.data_value.as_str()).collect::<Vec<_>>(), vec!["98", "97"]);

        let latest = storage.latest_measurements(&patient).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].data_value, "97");
        assert!(storage.patient(&patient).unwrap().is_some());
    }

    #[test]
    fn test_measurements_within_period() {
        let storage = StorageEngine::in_memory();
        let patient = PatientUuid::new("p-1");
        let mut tx = storage.begin().unwrap();
        let spo2 = oximeter(&mut tx);
        for day in 1..=5 {
            tx.write_if_new(NewMeasurement::new(&spo2, &patient, "95", at(2024, 1, day)));
        }
        tx.commit().unwrap();

        let window = storage
            .measurements(&patient, spo2.attribute_id, Some(at(2024, 1, 2)), Some(at(2024, 1, 4)))
            .unwrap();
        assert_eq!(window.len(), 3);

        let reversed = storage.measurements(&patient, spo2.attribute_id, Some(at(2024, 1, 4)), Some(at(2024, 1, 2)));
        assert!(matches!(reversed, Err(StorageError::InvalidTimeRange(_))));
    }

    #[test]
    fn test_threshold_versions() {
        let storage = StorageEngine::in_memory();
        let patient = PatientUuid::new("p-1");
        let mut tx = storage.begin().unwrap();
        let spo2 = oximeter(&mut tx);
        tx.commit().unwrap();

        let mut tx = storage.begin().unwrap();
        for (effective, low, high) in [(at(2024, 6, 1), "65", "105"), (at(2024, 1, 1), "60", "100")] {
            tx.insert_threshold(NewThreshold {
                attribute_id: spo2.attribute_id,
                patient_uuid: patient.clone(),
                threshold_type: ThresholdKind::SimpleInclusiveHighLow,
                threshold_low_value: low.to_string(),
                threshold_high_value: high.to_string(),
                effective_date: effective,
            })
            .unwrap();
        }
        tx.commit().unwrap();

        let march = storage.effective_threshold(spo2.attribute_id, &patient, at(2024, 3, 1)).unwrap().unwrap();
        assert_eq!(march.threshold_low_value, "60");
        let july = storage.effective_threshold(spo2.attribute_id, &patient, at(2024, 7, 1)).unwrap().unwrap();
        assert_eq!(july.threshold_low_value, "65");
        assert!(storage.effective_threshold(spo2.attribute_id, &patient, at(2023, 1, 1)).unwrap().is_none());

        let earliest = storage.earliest_threshold(spo2.attribute_id, &patient).unwrap().unwrap();
        assert_eq!(earliest.effective_date, at(2024, 1, 1));

        let ordered = storage.thresholds(&patient, spo2.attribute_id).unwrap();
        assert_eq!(ordered[0].threshold_low_value, "60");
    }

    #[test]
    fn test_patients_by_group() {
        let storage = StorageEngine::in_memory();
        let mut tx = storage.begin().unwrap();
        tx.register_patient(Patient { patient_uuid: PatientUuid::new("a"), patient_group: Some("north".to_string()) });
        tx.register_patient(Patient { patient_uuid: PatientUuid::new("b"), patient_group: None });
        tx.commit().unwrap();

        let mut tx = storage.begin().unwrap();
        tx.register_patient(Patient { patient_uuid: PatientUuid::new("b"), patient_group: Some("north".to_string()) });
        tx.commit().unwrap();

        assert_eq!(storage.patients(None).unwrap().len(), 2);
        assert_eq!(storage.patients(Some("north")).unwrap().len(), 2);
        assert!(storage.patients(Some("south")).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_after_flush_with_stale_wal() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig { path: Some(dir.path().to_path_buf()) };
        let patient = PatientUuid::new("p-1");
        let wal_path = dir.path().join("tables.wal");

        let stale_wal = {
            let storage = StorageEngine::open(&config).unwrap();
            let mut tx = storage.begin().unwrap();
            let spo2 = oximeter(&mut tx);
            tx.ensure_patient(&patient);
            tx.write_if_new(NewMeasurement::new(&spo2, &patient, "98", at(2024, 1, 1)));
            tx.commit().unwrap();

            let logged = std::fs::read(&wal_path).unwrap();
            storage.flush_all().unwrap();
            logged
        };

        // Crash between the snapshot rename and the log truncation
        std::fs::write(&wal_path, &stale_wal).unwrap();

        let storage = StorageEngine::open(&config).unwrap();
        assert_eq!(storage.device_types().unwrap().len(), 1);
        assert_eq!(storage.attributes().unwrap().len(), 1);
        assert_eq!(storage.measurement_count().unwrap(), 1);
        assert_eq!(storage.patients(None).unwrap().len(), 1);

        // New writes continue from the recovered ids
        let mut tx = storage.begin().unwrap();
        let spo2 = oximeter(&mut tx);
        assert!(!tx.write_if_new(NewMeasurement::new(&spo2, &patient, "98", at(2024, 1, 1))));
        assert!(tx.write_if_new(NewMeasurement::new(&spo2, &patient, "97", at(2024, 1, 2))));
        tx.commit().unwrap();
        drop(storage);

        let reopened = StorageEngine::open(&config).unwrap();
        assert_eq!(reopened.measurement_count().unwrap(), 2);
        assert_eq!(reopened.device_types().unwrap().len(), 1);
    }

    #[test]
    fn test_attributes_with_data() {
        let storage = StorageEngine::in_memory();
        let patient = PatientUuid::new("p-1");
        let mut tx = storage.begin().unwrap();
        let device_type = tx.resolve_or_create_type("Oximeter", "Contec", "CMS50D+", "Finger Oximeter");
        let pulse = tx.resolve_or_create_attribute(&device_type, "pulse", "BPM", "INTEGER");
        let spo2 = tx.resolve_or_create_attribute(&device_type, "spo2", "%", "INTEGER");
        tx.write_if_new(NewMeasurement::new(&spo2, &patient, "98", at(2024, 1, 1)));
        tx.commit().unwrap();

        let with_data = storage.attributes_with_data(&patient, &[]).unwrap();
        assert_eq!(with_data, vec![spo2.clone()]);
        assert!(storage.attributes_with_data(&patient, &["pulse".to_string()]).unwrap().is_empty());
        assert_eq!(storage.attributes().unwrap().len(), 2);
        assert_eq!(storage.attribute(pulse.attribute_id).unwrap(), Some(pulse));
    }
}
