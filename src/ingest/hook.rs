use std::io;
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::model::PatientUuid;

const PATIENT_TOKEN: &str = "__PATIENT_UUID__";

/// External command run after a submission wrote new data
#[derive(Debug, Clone)]
pub struct SubmissionHook {
    command: String,
}

impl SubmissionHook {
    pub fn new(command: impl Into<String>) -> Self {
        SubmissionHook { command: command.into() }
    }

    pub fn from_config(config: &IngestConfig) -> Option<Self> {
        config.submission_script
            .as_deref()
            .filter(|script| !script.trim().is_empty())
            .map(SubmissionHook::new)
    }

    /// Program and arguments with the patient substituted in
    pub fn command_for(&self, patient: &PatientUuid) -> Vec<String> {
        self.command
            .replace(PATIENT_TOKEN, patient.as_str())
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub async fn run(&self, patient: &PatientUuid) -> io::Result<ExitStatus> {
        let argv = self.command_for(patient);
        let (program, args) = argv.split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty submission command"))?;
        debug!(program = %program, patient = %patient, "Running submission hook");
        Command::new(program).args(args).status().await
    }

    /// Run in the background. Failures are logged and never reach the caller.
    pub fn fire(&self, patient: &PatientUuid) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(patient = %patient, "No runtime available, submission hook skipped");
                return;
            }
        };

        let hook = self.clone();
        let patient = patient.clone();
        handle.spawn(async move {
            match hook.run(&patient).await {
                Ok(status) if status.success() => {
                    info!(patient = %patient, "Submission hook completed");
                }
                Ok(status) => {
                    warn!(patient = %patient, code = ?status.code(), "Submission hook exited with failure");
                }
                Err(e) => {
                    warn!(patient = %patient, error = %e, "Submission hook could not be started");
                }
            }
        });
    }
}
