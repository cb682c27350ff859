use std::path::{Path, PathBuf};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use serde::{Serialize, Deserialize};
use tracing::{debug, error, warn};

use crate::model::{AttributeThreshold, Patient, RecordingDeviceAttribute, RecordingDeviceData, RecordingDeviceType};
use super::{StorageError, Tables};

const SNAPSHOT_FILE: &str = "tables.snapshot";
const WAL_FILE: &str = "tables.wal";

/// One row-level change. A committed transaction is logged as a single
/// frame holding all of its entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum WalEntry {
    DeviceType(RecordingDeviceType),
    Attribute(RecordingDeviceAttribute),
    Data(RecordingDeviceData),
    Threshold(AttributeThreshold),
    Patient(Patient),
}

/// Manages the snapshot and write-ahead log on disk
#[derive(Debug)]
pub struct PersistenceManager {
    base_path: PathBuf,
    wal: WriteAheadLog,
}

impl PersistenceManager {
    pub fn new(base_path: impl AsRef<Path>) -> io::Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let wal = WriteAheadLog::new(base_path.join(WAL_FILE))?;

        Ok(PersistenceManager { base_path, wal })
    }

    /// Log a committed transaction. Returns once the frame is synced.
    pub fn append(&self, entries: &[WalEntry]) -> Result<(), StorageError> {
        self.wal.append(entries)
            .map_err(|e| StorageError::Persistence(format!("Failed to append to WAL: {}", e)))
    }

    /// Rebuild the tables from the last snapshot plus every logged frame
    pub fn load(&self) -> Result<Tables, StorageError> {
        let mut tables = self.load_snapshot()?;
        tables.rebuild_index();

        let frames = self.wal.replay()
            .map_err(|e| StorageError::Persistence(format!("Failed to replay WAL: {}", e)))?;
        debug!(frames = frames.len(), "Replaying write-ahead log");
        for entry in frames.into_iter().flatten() {
            tables.apply(entry);
        }

        Ok(tables)
    }

    /// Save every table to disk, then truncate the WAL
    pub fn save_snapshot(&self, tables: &Tables) -> Result<(), StorageError> {
        let snapshot_path = self.base_path.join(SNAPSHOT_FILE);
        let serialized = serde_json::to_vec(tables)
            .map_err(|e| StorageError::Persistence(format!("Serialization failed: {}", e)))?;

        // Write to a temporary file first
        let temp_path = snapshot_path.with_extension("tmp");
        let mut file = File::create(&temp_path)
            .map_err(|e| StorageError::Persistence(format!("Failed to create file: {}", e)))?;

        file.write_all(&serialized)
            .map_err(|e| StorageError::Persistence(format!("Failed to write data: {}", e)))?;

        file.sync_all()
            .map_err(|e| StorageError::Persistence(format!("Failed to sync data: {}", e)))?;

        fs::rename(&temp_path, &snapshot_path)
            .map_err(|e| StorageError::Persistence(format!("Failed to rename file: {}", e)))?;

        self.wal.truncate()
            .map_err(|e| StorageError::Persistence(format!("Failed to truncate WAL: {}", e)))
    }

    fn load_snapshot(&self) -> Result<Tables, StorageError> {
        let snapshot_path = self.base_path.join(SNAPSHOT_FILE);
        let mut file = match File::open(&snapshot_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Tables::default()),
            Err(e) => {
                return Err(StorageError::Persistence(format!("Failed to open snapshot: {}", e)));
            }
        };

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|e| StorageError::Persistence(format!("Failed to read snapshot: {}", e)))?;

        serde_json::from_slice(&buffer)
            .map_err(|e| StorageError::Persistence(format!("Failed to deserialize snapshot: {}", e)))
    }
}

/// Write-ahead log for crash recovery
#[derive(Debug)]
pub struct WriteAheadLog {
    log_path: PathBuf,
    log_file: Mutex<File>,
    /// Set when a failed append could not be cut back off the log. Further
    /// appends are refused until a snapshot truncates it.
    damaged: AtomicBool,
}

impl WriteAheadLog {
    pub fn new(log_path: impl AsRef<Path>) -> io::Result<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        let log_file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)?;

        Ok(WriteAheadLog {
            log_path,
            log_file: Mutex::new(log_file),
            damaged: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, File>> {
        self.log_file.lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "WAL lock poisoned"))
    }

    /// Append one frame: a 4-byte size header followed by the entries.
    /// A failed write is cut back off so later frames stay readable.
    pub fn append(&self, entries: &[WalEntry]) -> io::Result<()> {
        let serialized = serde_json::to_vec(entries)?;
        let frame_size = u32::try_from(serialized.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "WAL frame too large"))?;
        let mut frame = Vec::with_capacity(4 + serialized.len());
        frame.extend_from_slice(&frame_size.to_be_bytes());
        frame.extend_from_slice(&serialized);

        let mut log_file = self.lock()?;
        if self.damaged.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "WAL holds a partial frame and needs a snapshot"));
        }

        let committed_len = log_file.metadata()?.len();
        if let Err(e) = log_file.write_all(&frame).and_then(|_| log_file.sync_data()) {
            if let Err(restore) = log_file.set_len(committed_len) {
                error!(path = %self.log_path.display(), error = %restore, "Failed to remove partial WAL frame");
                self.damaged.store(true, Ordering::Release);
            }
            return Err(e);
        }

        Ok(())
    }

    /// Read back every complete frame. A torn frame at the tail is a write
    /// that never committed and is dropped.
    pub fn replay(&self) -> io::Result<Vec<Vec<WalEntry>>> {
        let mut log_file = self.lock()?;
        log_file.seek(SeekFrom::Start(0))?;

        let mut frames = Vec::new();
        loop {
            let mut size_buf = [0u8; 4];
            match log_file.read_exact(&mut size_buf) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let frame_size = u32::from_be_bytes(size_buf) as usize;
            let mut frame_data = vec![0u8; frame_size];
            match log_file.read_exact(&mut frame_data) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    warn!(path = %self.log_path.display(), "Dropping torn frame at end of WAL");
                    break;
                }
                Err(e) => return Err(e),
            }

            match serde_json::from_slice::<Vec<WalEntry>>(&frame_data) {
                Ok(entries) => frames.push(entries),
                Err(e) => {
                    warn!(path = %self.log_path.display(), error = %e, "Dropping unreadable WAL frame");
                    break;
                }
            }
        }

        Ok(frames)
    }

    /// Truncate the WAL after a snapshot has been safely persisted
    pub fn truncate(&self) -> io::Result<()> {
        let new_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&self.log_path)?;
        drop(new_file);

        let reopened = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.log_path)?;

        let mut log_file = self.lock()?;
        *log_file = reopened;
        self.damaged.store(false, Ordering::Release);

        Ok(())
    }
}
