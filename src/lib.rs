//! Vitalink: a telehealth measurement concentrator
//!
//! Patient units upload device readings in the native line format. Vitalink
//! stores them without duplicates, keeps versioned per-patient thresholds,
//! and classifies readings, patients and alerts against them on demand.

pub mod api;
pub mod clinical;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod storage;

pub use error::{Error, Result};
pub use storage::StorageEngine;
