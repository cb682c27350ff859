use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::model::ThresholdKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub ingest: IngestConfig,
    pub clinical: ClinicalConfig,
    pub alerts: AlertConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the write-ahead log and snapshots. Memory-only when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Command run after a submission wrote data. `__PATIENT_UUID__` is
    /// replaced with the submitting patient's uuid.
    pub submission_script: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicalConfig {
    /// Attribute names that count towards a patient's overall status
    pub required_attributes: Vec<String>,
    /// Fewest historic points a change-over-time prediction is made from
    pub fewest_change_points: usize,
}

impl Default for ClinicalConfig {
    fn default() -> Self {
        ClinicalConfig {
            required_attributes: vec![
                "heart_rate".to_string(),
                "spo2".to_string(),
                "systolic_pressure".to_string(),
                "diastolic_pressure".to_string(),
            ],
            fewest_change_points: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub send_in_threshold: bool,
    pub send_out_of_threshold: bool,
    pub send_cannot_calculate: bool,
    pub templates: HashMap<ThresholdKind, AlertTemplates>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        let mut templates = HashMap::new();
        templates.insert(ThresholdKind::SimpleInclusiveHighLow, AlertTemplates {
            passed: "__ATTRIBUTE_NAME__ of __DATA_VALUE__ __ATTRIBUTE_UNITS__ on __MEASUREMENT_DATE__ is within __LOWER_THRESHOLD_LIMIT__ to __UPPER_THRESHOLD_LIMIT__".to_string(),
            failed: "__ATTRIBUTE_NAME__ of __DATA_VALUE__ __ATTRIBUTE_UNITS__ on __MEASUREMENT_DATE__ is outside __LOWER_THRESHOLD_LIMIT__ to __UPPER_THRESHOLD_LIMIT__".to_string(),
            cannot_calculate: "__ATTRIBUTE_NAME__ on __MEASUREMENT_DATE__ could not be tested against its threshold".to_string(),
        });
        templates.insert(ThresholdKind::ChangeOverTime, AlertTemplates {
            passed: "__ATTRIBUTE_NAME__ of __DATA_VALUE__ __ATTRIBUTE_UNITS__ on __MEASUREMENT_DATE__ changed less than __MEASUREMENT_CHANGE_THRESHOLD__ over __MEASUREMENT_PERIOD__ hours".to_string(),
            failed: "__ATTRIBUTE_NAME__ of __DATA_VALUE__ __ATTRIBUTE_UNITS__ on __MEASUREMENT_DATE__ changed by more than __MEASUREMENT_CHANGE_THRESHOLD__ over __MEASUREMENT_PERIOD__ hours".to_string(),
            cannot_calculate: "__ATTRIBUTE_NAME__ on __MEASUREMENT_DATE__: not enough history over __MEASUREMENT_PERIOD__ hours to test the change".to_string(),
        });
        templates.insert(ThresholdKind::Questionnaire, AlertTemplates {
            passed: "__QUESTIONNAIRE_TYPE__ questionnaire on __MEASUREMENT_DATE__ raised no concerns".to_string(),
            failed: "__QUESTIONNAIRE_TYPE__ questionnaire on __MEASUREMENT_DATE__ raised a red flag".to_string(),
            cannot_calculate: "__QUESTIONNAIRE_TYPE__ questionnaire on __MEASUREMENT_DATE__ could not be read".to_string(),
        });

        AlertConfig {
            enabled: true,
            send_in_threshold: false,
            send_out_of_threshold: true,
            send_cannot_calculate: true,
            templates,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertTemplates {
    pub passed: String,
    pub failed: String,
    pub cannot_calculate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "vitalink=info".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clinical.fewest_change_points < 2 {
            return Err(ConfigError::Invalid(
                "clinical.fewest_change_points must be at least 2".to_string(),
            ));
        }
        if let Some(script) = &self.ingest.submission_script {
            if script.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "ingest.submission_script must not be blank".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Load and validate configuration. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No config file found, using defaults");
            return Ok(Config::default());
        }
        Err(source) => {
            return Err(ConfigError::Read { path: path.to_path_buf(), source });
        }
    };

    let config: Config = serde_yaml::from_str(&content)
        .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
    config.validate()?;
    Ok(config)
}
