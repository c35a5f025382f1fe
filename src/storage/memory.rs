// src/storage/memory.rs

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::storage::{Bucket, KvStore, StoreError};

/// In-process backend; contents vanish with the process
#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<BTreeMap<Bucket, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn put(&self, bucket: Bucket, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(bucket)
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        Ok(buckets.get(&bucket).and_then(|b| b.get(key)).cloned())
    }

    fn delete(&self, bucket: Bucket, key: &str) -> Result<bool, StoreError> {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        Ok(buckets
            .get_mut(&bucket)
            .map_or(false, |b| b.remove(key).is_some()))
    }

    fn scan(&self, bucket: Bucket) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        Ok(buckets
            .get(&bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn count(&self, bucket: Bucket) -> Result<usize, StoreError> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        Ok(buckets.get(&bucket).map_or(0, BTreeMap::len))
    }
}
