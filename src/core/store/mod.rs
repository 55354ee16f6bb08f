//! Host key/value storage and the typed persistence gateway built on it.
//!
//! The host only offers a flat document store. [`Persistence`] maps sessions,
//! model configurations and custom commands onto it and is the single place
//! that keeps empty transcripts out of storage.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use serde_json::Value;

pub mod file;
pub mod memory;
pub mod persistence;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use persistence::{Persistence, StoredSession};

/// Errors raised by a storage backend.
#[derive(Debug)]
pub enum StoreError {
    /// Reading or writing a record failed.
    Io {
        /// Path of the record involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A record held data that does not match its expected shape.
    Corrupt {
        /// Key of the offending record.
        key: String,
        /// The JSON decoding error.
        source: serde_json::Error,
    },

    /// The key cannot be mapped onto the backend.
    InvalidKey(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io { path, source } => {
                write!(f, "Failed to access record at {}: {}", path.display(), source)
            }
            StoreError::Corrupt { key, source } => {
                write!(f, "Stored record '{key}' is malformed: {source}")
            }
            StoreError::InvalidKey(key) => write!(f, "Invalid storage key: {key:?}"),
        }
    }
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            StoreError::Corrupt { source, .. } => Some(source),
            StoreError::InvalidKey(_) => None,
        }
    }
}

/// Flat document store provided by the host. Each call is independent; there
/// are no transactions across keys.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;

    fn keys(&self) -> Result<Vec<String>, StoreError>;
}
