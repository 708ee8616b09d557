//! Interpreter configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::error::StorageResult;
use super::storage::Storage;

/// Settings shared by every interpretation of one interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Identity exposed to scripts as `enclave.enclave_id`.
    pub enclave_id: String,
    /// Exposed to scripts as `enclave.env_vars`.
    pub enclave_env_vars: BTreeMap<String, String>,
    /// Evaluation step budget per module; `None` is unlimited.
    pub max_steps: Option<u64>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            enclave_id: uuid::Uuid::new_v4().to_string(),
            enclave_env_vars: BTreeMap::new(),
            max_steps: None,
        }
    }
}

impl InterpreterConfig {
    /// Write the configuration atomically.
    pub fn save(&self, storage: &Storage, path: &Path) -> StorageResult<()> {
        storage.write_json(path, self)
    }

    /// Load a configuration file.
    pub fn load(storage: &Storage, path: &Path) -> StorageResult<Self> {
        storage.read_json(path)
    }
}
