//! Filesystem helpers and atomic write operations
//!
//! Enclave history and interpreter configuration are small JSON documents.
//! Writes go through a temp file, fsync and rename so a crash never leaves a
//! half-written history behind.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::error::{StorageError, StorageResult};

/// Storage manager rooted at a state directory
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the enclave history file path
    pub fn history_path(&self) -> PathBuf {
        self.root.join("history.json")
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let temp_path = path.with_extension("tmp");
        let failed = |detail: String| StorageError::AtomicWriteFailed {
            path: path.to_path_buf(),
            detail,
        };

        let mut file = File::create(&temp_path)
            .map_err(|e| failed(format!("create {:?}: {}", temp_path, e)))?;
        file.write_all(data)
            .map_err(|e| failed(format!("write: {}", e)))?;
        file.sync_all()
            .map_err(|e| failed(format!("sync: {}", e)))?;
        drop(file);

        fs::rename(&temp_path, path)
            .map_err(|e| failed(format!("rename {:?}: {}", temp_path, e)))?;

        // Sync parent directory
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let dir = OpenOptions::new().read(true).open(parent)?;
            dir.sync_all()?;
        }

        Ok(())
    }

    /// Read a file
    pub fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>> {
        if !path.exists() {
            return Err(StorageError::PathNotFound(path.to_path_buf()));
        }
        Ok(fs::read(path)?)
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    /// Serialize `value` as pretty JSON and write it atomically
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(value)?;
        self.write_atomic(path, &json)
    }

    /// Read and deserialize a JSON file
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> StorageResult<T> {
        let data = self.read_file(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Create the state directory if needed
pub fn init_storage(root: &Path) -> StorageResult<Storage> {
    let storage = Storage::new(root.to_path_buf());
    storage.create_dir_all(root)?;
    Ok(storage)
}
