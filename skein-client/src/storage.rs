//! Key/value storage adapters.

use crate::lock;
use skein_core::{KeyValueStorage, StorageError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Process-local storage. Lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        lock(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// JSON-file storage, rewritten on every change.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Open `path`, loading existing values. A missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let values = load(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = lock(&self.values);
        values.insert(key.to_string(), value.to_string());
        save(&self.path, &values)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut values = lock(&self.values);
        if values.remove(key).is_none() {
            return Ok(());
        }
        save(&self.path, &values)
    }
}

fn load(path: &Path) -> Result<Option<BTreeMap<String, String>>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    let values = serde_json::from_str(&contents)?;
    Ok(Some(values))
}

fn save(path: &Path, values: &BTreeMap<String, String>) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(values)?;
    std::fs::write(path, contents)?;
    Ok(())
}
