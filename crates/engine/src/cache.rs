//! The base cache: typed per-collection arrays, one serialised blob each.
//!
//! Reads hand out owned copies; writes replace the whole array. Collections
//! are bounded (hundreds to low thousands of rows), so whole-blob
//! replacement stays cheap and keeps every save atomic at the storage
//! layer.

use std::collections::HashSet;
use std::sync::Arc;
use tillsync_api::KvStore;
use tillsync_types::error::StoreError;
use tillsync_types::{keys, Collection, Entity, EntityId, TimestampMs};

pub struct LocalCache {
    kv: Arc<dyn KvStore>,
}

impl LocalCache {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn rows<T: Entity>(&self) -> Result<Vec<T>, StoreError> {
        match self.kv.get(T::COLLECTION.key()).await? {
            Some(raw) => serde_json::from_slice(&raw).map_err(|e| {
                StoreError::Decode(format!("collection {}: {e}", T::COLLECTION))
            }),
            None => Ok(Vec::new()),
        }
    }

    pub async fn save_rows<T: Entity>(&self, rows: &[T]) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(rows)
            .map_err(|e| StoreError::Encode(format!("collection {}: {e}", T::COLLECTION)))?;
        self.kv.put(T::COLLECTION.key(), &raw).await
    }

    pub async fn find<T: Entity>(&self, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.rows::<T>().await?.into_iter().find(|r| r.id() == id))
    }

    /// Ids present in a collection, decoded without committing to a full
    /// entity shape.
    pub async fn ids(&self, collection: Collection) -> Result<HashSet<EntityId>, StoreError> {
        let raw = match self.kv.get(collection.key()).await? {
            Some(raw) => raw,
            None => return Ok(HashSet::new()),
        };
        let rows: Vec<serde_json::Value> = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Decode(format!("collection {collection}: {e}")))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("id").and_then(|v| v.as_str()).map(String::from))
            .collect())
    }

    pub async fn is_initialized(
        &self,
        collection: Collection,
        user_key: &str,
    ) -> Result<bool, StoreError> {
        let key = keys::cache_initialized_key(collection, user_key);
        Ok(self.kv.get(&key).await?.is_some())
    }

    pub async fn mark_initialized(
        &self,
        collection: Collection,
        user_key: &str,
    ) -> Result<(), StoreError> {
        let key = keys::cache_initialized_key(collection, user_key);
        self.kv.put(&key, b"1").await
    }

    pub async fn last_sync(&self, collection: Collection) -> Result<Option<TimestampMs>, StoreError> {
        let key = keys::last_sync_key(collection);
        match self.kv.get(&key).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| StoreError::Decode(format!("last sync {collection}: {e}"))),
            None => Ok(None),
        }
    }

    pub async fn set_last_sync(
        &self,
        collection: Collection,
        ts: TimestampMs,
    ) -> Result<(), StoreError> {
        let key = keys::last_sync_key(collection);
        let raw = serde_json::to_vec(&ts)
            .map_err(|e| StoreError::Encode(format!("last sync {collection}: {e}")))?;
        self.kv.put(&key, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_test_utils::MemoryKv;
    use tillsync_types::{Product, VersionMeta};

    fn product(id: &str, stock: i64) -> Product {
        Product {
            id: id.into(),
            organization_id: "org".into(),
            name: format!("product {id}"),
            category: String::new(),
            price: 100,
            stock,
            is_active: true,
            created_at: 1,
            updated_at: 1,
            version: VersionMeta::default(),
        }
    }

    #[tokio::test]
    async fn test_rows_round_trip() {
        let cache = LocalCache::new(Arc::new(MemoryKv::new()));
        assert!(cache.rows::<Product>().await.unwrap().is_empty());

        cache
            .save_rows(&[product("p1", 5), product("p2", 0)])
            .await
            .unwrap();
        let rows = cache.rows::<Product>().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(cache.find::<Product>("p2").await.unwrap().unwrap().stock, 0);
    }

    #[tokio::test]
    async fn test_ids_without_typed_decode() {
        let cache = LocalCache::new(Arc::new(MemoryKv::new()));
        cache.save_rows(&[product("p1", 5)]).await.unwrap();
        let ids = cache.ids(Collection::Products).await.unwrap();
        assert!(ids.contains("p1"));
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_initialization_markers() {
        let cache = LocalCache::new(Arc::new(MemoryKv::new()));
        assert!(!cache
            .is_initialized(Collection::Players, "u1")
            .await
            .unwrap());
        cache.mark_initialized(Collection::Players, "u1").await.unwrap();
        assert!(cache.is_initialized(Collection::Players, "u1").await.unwrap());
        // Markers are per user context.
        assert!(!cache
            .is_initialized(Collection::Players, "u2")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_last_sync_round_trip() {
        let cache = LocalCache::new(Arc::new(MemoryKv::new()));
        assert_eq!(cache.last_sync(Collection::Products).await.unwrap(), None);
        cache.set_last_sync(Collection::Products, 42).await.unwrap();
        assert_eq!(
            cache.last_sync(Collection::Products).await.unwrap(),
            Some(42)
        );
    }
}
