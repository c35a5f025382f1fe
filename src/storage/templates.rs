// src/storage/templates.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{Bucket, Store, StoreError};
use crate::vm::machine::VmConfig;

/// Reusable VM configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigTemplate {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub config: VmConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConfigTemplate {
    /// New template with a fresh identity
    pub fn new(name: impl Into<String>, description: Option<String>, config: VmConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description,
            config,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Template persistence in the `configs` bucket
#[derive(Clone)]
pub struct TemplateStore {
    store: Store,
}

impl TemplateStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn create(&self, template: &ConfigTemplate) -> Result<(), StoreError> {
        if self.store.exists(Bucket::Configs, &template.id)? {
            return Err(StoreError::AlreadyExists {
                bucket: Bucket::Configs,
                key: template.id.clone(),
            });
        }
        self.store.put_json(Bucket::Configs, &template.id, template)
    }

    pub fn get(&self, id: &str) -> Result<ConfigTemplate, StoreError> {
        self.store
            .get_json(Bucket::Configs, id)?
            .ok_or_else(|| StoreError::not_found(Bucket::Configs, id))
    }

    /// Replaces an existing template and bumps `updated_at`
    pub fn update(&self, template: &mut ConfigTemplate) -> Result<(), StoreError> {
        if !self.store.exists(Bucket::Configs, &template.id)? {
            return Err(StoreError::not_found(Bucket::Configs, &template.id));
        }
        template.updated_at = Utc::now();
        self.store.put_json(Bucket::Configs, &template.id, template)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        if self.store.delete(Bucket::Configs, id)? {
            Ok(())
        } else {
            Err(StoreError::not_found(Bucket::Configs, id))
        }
    }

    pub fn list(&self) -> Result<Vec<ConfigTemplate>, StoreError> {
        self.store.list_json(Bucket::Configs)
    }

    pub fn get_by_name(&self, name: &str) -> Result<ConfigTemplate, StoreError> {
        self.list()?
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| StoreError::not_found(Bucket::Configs, name))
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.store.count(Bucket::Configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::vm::machine::tests::sample_config;

    #[test]
    fn templates_roundtrip_through_the_store() {
        let templates = TemplateStore::new(Store::memory());
        let mut t = ConfigTemplate::new("small", Some("1 vcpu".into()), sample_config("small"));

        templates.create(&t).unwrap();
        assert_eq!(templates.get_by_name("small").unwrap().id, t.id);

        let before = t.updated_at;
        t.config.cpus = 1;
        templates.update(&mut t).unwrap();
        assert!(t.updated_at >= before);
        assert_eq!(templates.get(&t.id).unwrap().config.cpus, 1);

        assert_eq!(templates.count().unwrap(), 1);
        templates.delete(&t.id).unwrap();
        assert_eq!(templates.get(&t.id).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            templates.get_by_name("small").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
