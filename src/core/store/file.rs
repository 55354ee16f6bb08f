use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::NamedTempFile;

use super::{KeyValueStore, StoreError};

const RECORD_EXTENSION: &str = "json";

/// One pretty-printed JSON document per key under a data directory.
///
/// Writes go through a temp file in the same directory and an atomic rename,
/// so a crash never leaves a half-written record behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.{RECORD_EXTENSION}")))
    }

    fn io_error(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.record_path(key)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Self::io_error(&path, err)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.record_path(key)?;
        fs::create_dir_all(&self.root).map_err(|err| Self::io_error(&self.root, err))?;

        let contents = serde_json::to_string_pretty(&value).map_err(|source| StoreError::Corrupt {
            key: key.to_string(),
            source,
        })?;

        let mut temp_file =
            NamedTempFile::new_in(&self.root).map_err(|err| Self::io_error(&self.root, err))?;
        temp_file
            .write_all(contents.as_bytes())
            .map_err(|err| Self::io_error(temp_file.path(), err))?;
        temp_file
            .as_file_mut()
            .sync_all()
            .map_err(|err| Self::io_error(&path, err))?;
        temp_file
            .persist(&path)
            .map_err(|err| Self::io_error(&path, err.error))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let path = self.record_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(&path, err)),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Self::io_error(&self.root, err)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| Self::io_error(&self.root, err))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}
