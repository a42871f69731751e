use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::StoreError;
use crate::filter::Filter;

/// Unified CRUD over the configuration collections.
///
/// Documents are JSON objects. `update_one` has `$set` semantics: the
/// provided fields are merged into the matched document, everything else
/// is left untouched.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Find the first document matching `filter`.
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Value, StoreError>;

    /// Find all documents matching `filter` (all documents when empty).
    async fn find_list(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, StoreError>;

    /// Insert a document. Fails with [`StoreError::Conflict`] when a unique
    /// index would be violated.
    async fn insert_one(&self, collection: &str, doc: Value) -> Result<(), StoreError>;

    /// Merge `set` into the first document matching `filter`.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        set: Value,
    ) -> Result<(), StoreError>;

    /// Delete the first document matching `filter`.
    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<(), StoreError>;

    /// Declare composite unique keys for a collection.
    async fn create_indexes(
        &self,
        collection: &str,
        unique_keys: &[&[&str]],
    ) -> Result<(), StoreError>;

    /// Dump every collection, for snapshots.
    async fn dump_all(&self) -> Result<BTreeMap<String, Vec<Value>>, StoreError>;

    /// Replace collection contents wholesale, for snapshot restore.
    async fn restore_all(&self, data: BTreeMap<String, Vec<Value>>) -> Result<(), StoreError>;
}

/// Typed convenience wrappers over the JSON-document trait surface.
#[async_trait]
pub trait ConfigStoreExt: ConfigStore {
    /// `find_one` deserialized into `T`.
    async fn get_one<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<T, StoreError> {
        let doc = self.find_one(collection, filter).await?;
        serde_json::from_value(doc)
            .map_err(|e| StoreError::Backend(format!("document decode failed: {e}")))
    }

    /// `find_list` deserialized into `Vec<T>`.
    async fn get_list<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<T>, StoreError> {
        let docs = self.find_list(collection, filter).await?;
        docs.into_iter()
            .map(|doc| {
                serde_json::from_value(doc)
                    .map_err(|e| StoreError::Backend(format!("document decode failed: {e}")))
            })
            .collect()
    }

    /// Serialize and insert a typed document.
    async fn put_one<T: Serialize + Sync>(
        &self,
        collection: &str,
        doc: &T,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(doc)
            .map_err(|e| StoreError::Backend(format!("document encode failed: {e}")))?;
        self.insert_one(collection, value).await
    }
}

impl<S: ConfigStore + ?Sized> ConfigStoreExt for S {}
