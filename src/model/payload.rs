use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The upload envelope a patient unit sends: one entry per device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicesPayload {
    pub upload_uuid: String,
    #[serde(default)]
    pub uploaded_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Vec<DeviceData>,
}

/// One device's serialized block inside an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceData {
    pub device_data_uuid: String,
    pub profile_id: String,  // e.g. "urn:nhs-en:profile:Oximeter"
    pub payload: String,     // Native format text
}

impl DeviceData {
    /// Device type token: whatever follows the last ':' of the profile id.
    /// `None` when that token is blank.
    pub fn device_type(&self) -> Option<&str> {
        let token = match self.profile_id.rfind(':') {
            Some(idx) => &self.profile_id[idx + 1..],
            None => self.profile_id.as_str(),
        };
        let token = token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token)
        }
    }
}

/// Value of the `Data-Format` request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Native,
}

impl FromStr for DataFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(DataFormat::Native),
            other => Err(format!("unsupported data format: {}", other)),
        }
    }
}
