// src/storage/mod.rs

//! Durable key-value persistence.
//!
//! Backends implement [`KvStore`], an opaque map of `(bucket, key) -> bytes`.
//! [`Store`] adds the typed JSON boundary on top, and the record stores in the
//! submodules add per-entity semantics.

pub mod memory;
pub mod sqlite;
pub mod templates;
pub mod users;
pub mod vms;

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::config::{StorageBackend, ServiceConfig};
use crate::error::ErrorKind;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use templates::{ConfigTemplate, TemplateStore};
pub use users::UserStore;
pub use vms::VmStore;

/// Logical namespaces in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    /// VM records
    Vms,

    /// Configuration templates
    Configs,

    /// User records
    Users,

    /// Reserved for server-side sessions
    Sessions,

    /// Miscellaneous settings
    Settings,
}

impl Bucket {
    /// Every bucket, in creation order
    pub const ALL: [Bucket; 5] = [
        Bucket::Vms,
        Bucket::Configs,
        Bucket::Users,
        Bucket::Sessions,
        Bucket::Settings,
    ];

    /// Stable on-disk name
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Vms => "vms",
            Bucket::Configs => "configs",
            Bucket::Users => "users",
            Bucket::Sessions => "sessions",
            Bucket::Settings => "settings",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{bucket}/{key} not found")]
    NotFound {
        bucket: Bucket,
        key: String,
    },

    #[error("{bucket}/{key} already exists")]
    AlreadyExists {
        bucket: Bucket,
        key: String,
    },

    #[error("User already exists: {0}")]
    UserAlreadyExists(String),

    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Failed to encode or decode {bucket}/{key}: {error}")]
    Serialization {
        bucket: Bucket,
        key: String,
        error: String,
    },
}

impl StoreError {
    /// Error classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::AlreadyExists { .. } | StoreError::UserAlreadyExists(_) => {
                ErrorKind::Conflict
            }
            StoreError::Open(_) | StoreError::Backend(_) | StoreError::Serialization { .. } => {
                ErrorKind::Internal
            }
        }
    }

    pub(crate) fn not_found(bucket: Bucket, key: &str) -> Self {
        StoreError::NotFound {
            bucket,
            key: key.to_string(),
        }
    }
}

/// Opaque durable map keyed by bucket and string key
///
/// Each call is independently consistent; callers needing check-then-write
/// atomicity serialise themselves.
pub trait KvStore: Send + Sync {
    /// Inserts or replaces a value
    fn put(&self, bucket: Bucket, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Fetches a value
    fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Removes a value, returning whether it existed
    fn delete(&self, bucket: Bucket, key: &str) -> Result<bool, StoreError>;

    /// All entries of a bucket ordered by key
    fn scan(&self, bucket: Bucket) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Whether a key is present
    fn exists(&self, bucket: Bucket, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(bucket, key)?.is_some())
    }

    /// Number of entries in a bucket
    fn count(&self, bucket: Bucket) -> Result<usize, StoreError> {
        Ok(self.scan(bucket)?.len())
    }

    /// Visits every entry of a bucket, stopping at the first error
    fn for_each(
        &self,
        bucket: Bucket,
        f: &mut dyn FnMut(&str, &[u8]) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        for (key, value) in self.scan(bucket)? {
            f(&key, &value)?;
        }
        Ok(())
    }
}

/// Typed JSON view over a [`KvStore`]
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn KvStore>,
}

impl Store {
    /// Wraps a backend
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self { inner }
    }

    /// Volatile store, mostly for tests
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Opens the backend selected by the configuration
    pub fn open(config: &ServiceConfig) -> Result<Self, StoreError> {
        match config.storage.backend {
            StorageBackend::Memory => Ok(Self::memory()),
            StorageBackend::Sqlite => {
                let path = config.database_path();
                Ok(Self::new(Arc::new(SqliteStore::open(&path)?)))
            }
        }
    }

    /// Underlying backend
    pub fn raw(&self) -> &Arc<dyn KvStore> {
        &self.inner
    }

    /// Serialises and stores a value
    pub fn put_json<T: Serialize>(&self, bucket: Bucket, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
            bucket,
            key: key.to_string(),
            error: e.to_string(),
        })?;
        self.inner.put(bucket, key, &bytes)
    }

    /// Loads and deserialises a value
    pub fn get_json<T: DeserializeOwned>(&self, bucket: Bucket, key: &str) -> Result<Option<T>, StoreError> {
        match self.inner.get(bucket, key)? {
            Some(bytes) => decode(bucket, key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Loads every value of a bucket
    pub fn list_json<T: DeserializeOwned>(&self, bucket: Bucket) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        self.inner.for_each(bucket, &mut |key, bytes| {
            out.push(decode(bucket, key, bytes)?);
            Ok(())
        })?;
        Ok(out)
    }

    /// Removes a value, returning whether it existed
    pub fn delete(&self, bucket: Bucket, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(bucket, key)
    }

    /// Whether a key is present
    pub fn exists(&self, bucket: Bucket, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(bucket, key)
    }

    /// Number of entries in a bucket
    pub fn count(&self, bucket: Bucket) -> Result<usize, StoreError> {
        self.inner.count(bucket)
    }
}

fn decode<T: DeserializeOwned>(bucket: Bucket, key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization {
        bucket,
        key: key.to_string(),
        error: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
        size: u32,
    }

    #[test]
    fn typed_values_survive_the_boundary() {
        let store = Store::memory();
        let item = Item {
            name: "disk".into(),
            size: 7,
        };

        store.put_json(Bucket::Settings, "a", &item).unwrap();
        assert_eq!(store.get_json::<Item>(Bucket::Settings, "a").unwrap(), Some(item));
        assert_eq!(store.get_json::<Item>(Bucket::Settings, "b").unwrap(), None);
        assert_eq!(store.count(Bucket::Settings).unwrap(), 1);
        assert_eq!(store.count(Bucket::Vms).unwrap(), 0);
    }

    #[test]
    fn mistyped_values_report_serialization_errors() {
        let store = Store::memory();
        store.raw().put(Bucket::Settings, "bad", b"not json").unwrap();

        let err = store.get_json::<Item>(Bucket::Settings, "bad").unwrap_err();
        assert!(matches!(err, StoreError::Serialization { .. }));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
