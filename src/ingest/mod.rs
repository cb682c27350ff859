//! Upload processing
//!
//! Turns an upload envelope into stored measurements. Each device payload in
//! the envelope is parsed and written inside its own transaction, so a
//! malformed payload leaves earlier payloads of the same upload committed.

pub mod hook;
pub mod native;

pub use hook::SubmissionHook;
pub use native::{DataField, DataRow, DeviceIdentity, NativeParser, ParseError, PayloadMetadata};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::model::payload::{DataFormat, DeviceData, DevicesPayload};
use crate::model::{PatientUuid, RecordingDeviceType};
use crate::storage::{NewMeasurement, StorageEngine, StorageError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("The request has no payload")]
    EmptyEnvelope,
    #[error("Unable to identify the device type from profile id '{0}'")]
    UnknownProfile(String),
    #[error("Unable to parse the payload with profile id '{profile_id}': {source}")]
    Parse {
        profile_id: String,
        #[source]
        source: ParseError,
    },
    #[error("Failed to store data: {0}")]
    Storage(#[from] StorageError),
}

impl IngestError {
    /// Malformed input as opposed to a failure on our side
    pub fn is_client_error(&self) -> bool {
        !matches!(self, IngestError::Storage(_))
    }
}

/// Outcome of one upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub upload_uuid: String,
    pub payloads: usize,
    pub rows_written: usize,
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    storage: Arc<StorageEngine>,
    hook: Option<SubmissionHook>,
}

impl Ingestor {
    pub fn new(storage: Arc<StorageEngine>, config: &IngestConfig) -> Self {
        Ingestor {
            storage,
            hook: SubmissionHook::from_config(config),
        }
    }

    /// Store every payload of the envelope for `patient`.
    ///
    /// Stops at the first failing payload; payloads before it stay committed.
    pub async fn process(
        &self,
        envelope: &DevicesPayload,
        patient: &PatientUuid,
        format: DataFormat,
    ) -> Result<IngestReport, IngestError> {
        if envelope.payload.is_empty() {
            warn!(upload = %envelope.upload_uuid, patient = %patient, "Upload has no payload");
            return Err(IngestError::EmptyEnvelope);
        }

        let mut rows_written = 0;
        for device in &envelope.payload {
            let written = match format {
                DataFormat::Native => self.store_native(device, patient),
            };
            match written {
                Ok(rows) => {
                    info!(
                        profile_id = %device.profile_id,
                        device_data = %device.device_data_uuid,
                        rows,
                        "Payload stored"
                    );
                    rows_written += rows;
                }
                Err(e) => {
                    if e.is_client_error() {
                        warn!(upload = %envelope.upload_uuid, patient = %patient, error = %e, "Rejected payload");
                    } else {
                        error!(upload = %envelope.upload_uuid, patient = %patient, error = %e, "Failed to store payload");
                    }
                    // Earlier payloads are committed and still get notified
                    self.notify(patient, rows_written);
                    return Err(e);
                }
            }
        }

        info!(upload = %envelope.upload_uuid, patient = %patient, rows_written, "Upload processed");
        self.notify(patient, rows_written);

        Ok(IngestReport {
            upload_uuid: envelope.upload_uuid.clone(),
            payloads: envelope.payload.len(),
            rows_written,
        })
    }

    fn notify(&self, patient: &PatientUuid, rows_written: usize) {
        if rows_written == 0 {
            return;
        }
        if let Some(hook) = &self.hook {
            hook.fire(patient);
        }
    }

    /// Parse and write one device payload inside a single transaction
    fn store_native(&self, device: &DeviceData, patient: &PatientUuid) -> Result<usize, IngestError> {
        let device_type = device.device_type()
            .ok_or_else(|| IngestError::UnknownProfile(device.profile_id.clone()))?;
        debug!(device_type, device_data = %device.device_data_uuid, "Parsing payload");

        let mut tx = self.storage.begin()?;
        tx.ensure_patient(patient);

        let mut types: HashMap<DeviceIdentity, RecordingDeviceType> = HashMap::new();
        for row in NativeParser::new(&device.payload) {
            let row = row.map_err(|source| IngestError::Parse {
                profile_id: device.profile_id.clone(),
                source,
            })?;

            let recording_type = match types.get(&row.device) {
                Some(known) => known.clone(),
                None => {
                    let resolved = tx.resolve_or_create_type(
                        device_type,
                        &row.device.make,
                        &row.device.model,
                        &row.device.display_name,
                    );
                    types.insert(row.device.clone(), resolved.clone());
                    resolved
                }
            };

            for field in &row.fields {
                let attribute = tx.resolve_or_create_attribute(
                    &recording_type,
                    &field.attribute_name,
                    &field.units,
                    &field.format,
                );
                let measurement = NewMeasurement::new(&attribute, patient, field.value.as_str(), row.time)
                    .with_schedule(row.schedule);
                if !tx.write_if_new(measurement) {
                    // The rest of the row is abandoned once a duplicate is seen
                    debug!(line = row.line, attribute = %field.attribute_name, value = %field.value, "Duplicate data");
                    break;
                }
            }
        }

        Ok(tx.commit()?)
    }
}
