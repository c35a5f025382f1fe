// src/storage/vms.rs

use crate::storage::{Bucket, Store, StoreError};
use crate::vm::instance::VmRecord;

/// VM record persistence
#[derive(Clone)]
pub struct VmStore {
    store: Store,
}

impl VmStore {
    /// Creates a VM store over a typed store
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Inserts a new record; fails if the id is taken
    pub fn create(&self, vm: &VmRecord) -> Result<(), StoreError> {
        if self.store.exists(Bucket::Vms, &vm.id)? {
            return Err(StoreError::AlreadyExists {
                bucket: Bucket::Vms,
                key: vm.id.clone(),
            });
        }
        self.store.put_json(Bucket::Vms, &vm.id, vm)
    }

    /// Fetches a record
    pub fn get(&self, id: &str) -> Result<VmRecord, StoreError> {
        self.store
            .get_json(Bucket::Vms, id)?
            .ok_or_else(|| StoreError::not_found(Bucket::Vms, id))
    }

    /// Replaces an existing record
    pub fn update(&self, vm: &VmRecord) -> Result<(), StoreError> {
        if !self.store.exists(Bucket::Vms, &vm.id)? {
            return Err(StoreError::not_found(Bucket::Vms, &vm.id));
        }
        self.store.put_json(Bucket::Vms, &vm.id, vm)
    }

    /// Removes a record
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        if self.store.delete(Bucket::Vms, id)? {
            Ok(())
        } else {
            Err(StoreError::not_found(Bucket::Vms, id))
        }
    }

    /// All records
    pub fn list(&self) -> Result<Vec<VmRecord>, StoreError> {
        self.store.list_json(Bucket::Vms)
    }

    /// First record with the given name
    pub fn get_by_name(&self, name: &str) -> Result<VmRecord, StoreError> {
        self.list()?
            .into_iter()
            .find(|vm| vm.name == name)
            .ok_or_else(|| StoreError::not_found(Bucket::Vms, name))
    }

    /// Number of records
    pub fn count(&self) -> Result<usize, StoreError> {
        self.store.count(Bucket::Vms)
    }
}
