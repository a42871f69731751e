use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::collections;
use crate::error::StoreError;
use crate::filter::Filter;
use crate::store::ConfigStore;

/// One collection: its documents plus declared unique keys.
#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Value>,
    unique_keys: Vec<Vec<String>>,
}

impl Collection {
    /// Render the composite key value of `doc` under `key`, lowercasing
    /// `email` to honor the case-insensitive email index.
    fn key_value(doc: &Value, key: &[String]) -> Option<String> {
        let mut parts = Vec::with_capacity(key.len());
        for field in key {
            let raw = doc.get(field)?;
            let part = match raw {
                Value::String(s) if field == "email" => s.to_lowercase(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            parts.push(part);
        }
        Some(parts.join("\u{1f}"))
    }

    /// Check `doc` against every unique key, excluding the document at
    /// `skip` (used when updating in place).
    fn check_unique(&self, doc: &Value, skip: Option<usize>) -> Result<(), String> {
        for key in &self.unique_keys {
            let Some(candidate) = Self::key_value(doc, key) else {
                continue;
            };
            for (i, existing) in self.docs.iter().enumerate() {
                if Some(i) == skip {
                    continue;
                }
                if Self::key_value(existing, key).as_deref() == Some(candidate.as_str()) {
                    return Err(format!("duplicate value for unique key {}", key.join("+")));
                }
            }
        }
        Ok(())
    }
}

/// Embedded [`ConfigStore`]: per-collection document vectors behind a
/// single async `RwLock` map. Persistence is handled by the snapshot
/// machinery, not here.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    inner: RwLock<BTreeMap<String, Collection>>,
}

impl MemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with the standard collections and unique indexes declared.
    pub async fn with_standard_indexes() -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write().await;
            for name in collections::ALL {
                inner.entry((*name).to_owned()).or_default();
            }
            for (name, key) in collections::UNIQUE_INDEXES {
                let coll = inner.entry((*name).to_owned()).or_default();
                coll.unique_keys
                    .push(key.iter().map(|s| (*s).to_owned()).collect());
            }
        }
        store
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Value, StoreError> {
        let inner = self.inner.read().await;
        let coll = inner
            .get(collection)
            .ok_or_else(|| StoreError::not_found(collection))?;
        coll.docs
            .iter()
            .find(|doc| filter.matches(doc))
            .cloned()
            .ok_or_else(|| StoreError::not_found(collection))
    }

    async fn find_list(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError> {
        let inner = self.inner.read().await;
        let Some(coll) = inner.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(coll
            .docs
            .iter()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect())
    }

    async fn insert_one(&self, collection: &str, doc: Value) -> Result<(), StoreError> {
        if !doc.is_object() {
            return Err(StoreError::Backend("document must be a JSON object".into()));
        }
        let mut inner = self.inner.write().await;
        let coll = inner.entry(collection.to_owned()).or_default();
        coll.check_unique(&doc, None)
            .map_err(|detail| StoreError::conflict(collection, detail))?;
        coll.docs.push(doc);
        Ok(())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        set: Value,
    ) -> Result<(), StoreError> {
        let Value::Object(set_fields) = set else {
            return Err(StoreError::Backend("$set must be a JSON object".into()));
        };
        let mut inner = self.inner.write().await;
        let coll = inner
            .get_mut(collection)
            .ok_or_else(|| StoreError::not_found(collection))?;
        let idx = coll
            .docs
            .iter()
            .position(|doc| filter.matches(doc))
            .ok_or_else(|| StoreError::not_found(collection))?;

        let mut updated = coll.docs[idx].clone();
        if let Value::Object(target) = &mut updated {
            for (field, value) in set_fields {
                target.insert(field, value);
            }
        }
        coll.check_unique(&updated, Some(idx))
            .map_err(|detail| StoreError::conflict(collection, detail))?;
        coll.docs[idx] = updated;
        Ok(())
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let coll = inner
            .get_mut(collection)
            .ok_or_else(|| StoreError::not_found(collection))?;
        let idx = coll
            .docs
            .iter()
            .position(|doc| filter.matches(doc))
            .ok_or_else(|| StoreError::not_found(collection))?;
        coll.docs.remove(idx);
        Ok(())
    }

    async fn create_indexes(
        &self,
        collection: &str,
        unique_keys: &[&[&str]],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let coll = inner.entry(collection.to_owned()).or_default();
        for key in unique_keys {
            let key: Vec<String> = key.iter().map(|s| (*s).to_owned()).collect();
            if !coll.unique_keys.contains(&key) {
                coll.unique_keys.push(key);
            }
        }
        Ok(())
    }

    async fn dump_all(&self) -> Result<BTreeMap<String, Vec<Value>>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .iter()
            .map(|(name, coll)| (name.clone(), coll.docs.clone()))
            .collect())
    }

    async fn restore_all(&self, data: BTreeMap<String, Vec<Value>>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for (name, docs) in data {
            let coll = inner.entry(name).or_default();
            coll.docs = docs;
        }
        Ok(())
    }
}
