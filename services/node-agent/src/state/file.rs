//! Durable JSON state files.
//!
//! Each store owns one file. Writes go to a sibling temp file which is
//! fsynced and then renamed over the target, so after a crash the file holds
//! either the previous or the new content, never a mix.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::StoreError;

/// Where a store keeps its state.
#[derive(Debug, Clone)]
pub enum StateFile {
    /// JSON file on disk.
    Disk(PathBuf),
    /// Nothing is written (tests and mock mode).
    Memory,
}

impl StateFile {
    pub fn disk(path: impl Into<PathBuf>) -> Self {
        Self::Disk(path.into())
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Disk(path) => Some(path),
            Self::Memory => None,
        }
    }

    /// Load the persisted value.
    ///
    /// Returns `None` for in-memory stores and when the file doesn't exist yet.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        let Self::Disk(path) = self else {
            return Ok(None);
        };

        if !path.exists() {
            debug!(path = %path.display(), "No state file, starting empty");
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;

        let value = serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        Ok(Some(value))
    }

    /// Persist a value atomically.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), StoreError> {
        let Self::Disk(path) = self else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let content = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp = File::create(&tmp_path).map_err(io_error(&tmp_path))?;
            tmp.write_all(&content).map_err(io_error(&tmp_path))?;
            tmp.sync_all().map_err(io_error(&tmp_path))?;
        }

        fs::rename(&tmp_path, path).map_err(io_error(path))?;

        // Make the rename itself durable.
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        debug!(path = %path.display(), bytes = content.len(), "Saved state file");
        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::disk(dir.path().join("absent.json"));
        let loaded: Option<BTreeMap<String, u32>> = file.load().unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::disk(dir.path().join("nested").join("state.json"));

        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 1u32);
        file.save(&value).unwrap();

        let loaded: BTreeMap<String, u32> = file.load().unwrap().unwrap();
        assert_eq!(loaded, value);
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let result: Result<Option<BTreeMap<String, u32>>, _> = StateFile::disk(&path).load();
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_memory_file_is_inert() {
        let file = StateFile::Memory;
        file.save(&vec![1, 2, 3]).unwrap();
        let loaded: Option<Vec<i32>> = file.load().unwrap();
        assert!(loaded.is_none());
    }
}
