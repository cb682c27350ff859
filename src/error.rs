use thiserror::Error;

use crate::clinical::ClinicalError;
use crate::config::ConfigError;
use crate::ingest::IngestError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Clinical(#[from] ClinicalError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid listen address: {0}")]
    Address(String),
    #[error("Server error: {0}")]
    Server(#[from] warp::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
