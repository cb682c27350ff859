//! Clinical evaluation of stored measurements
//!
//! Nothing here is persisted: classifications, patient statuses and alerts
//! are recomputed from the stored measurements and thresholds every time
//! they are asked for.

pub mod alerts;
pub mod classify;
pub mod status;
pub mod threshold;

pub use alerts::{Alert, AlertGenerator};
pub use classify::{format_bound, Classification, ClassifiedMeasurement, Classifier};
pub use status::{aggregate_status, patient_overviews, PatientOverview};
pub use threshold::{create_threshold, ThresholdBounds, ThresholdRequest, ThresholdTest};

use thiserror::Error;

use crate::model::{AttributeId, UnknownThresholdKind};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ClinicalError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
    #[error(transparent)]
    UnknownThresholdType(#[from] UnknownThresholdKind),
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(AttributeId),
}

impl ClinicalError {
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ClinicalError::Storage(_))
    }
}
