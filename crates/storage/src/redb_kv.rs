use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tillsync_api::KvStore;
use tillsync_types::error::StoreError;

/// ---- Table definitions (single DB, string-keyed blobs) ----
const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("BLOBS");

/// A durable blob store backed by a single redb database file.
#[derive(Clone)]
pub struct RedbKv {
    db: Arc<Database>,
}

impl RedbKv {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(|e| StoreError::Backend(e.to_string()))?;

        // Ensure the table exists so first reads do not fail.
        {
            let w = db
                .begin_write()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            {
                w.open_table(BLOBS)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            }
            w.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl KvStore for RedbKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let r = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let table = r
            .open_table(BLOBS)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let value = table
            .get(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let w = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = w
                .open_table(BLOBS)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            table
                .insert(key, value)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        w.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let w = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = w
                .open_table(BLOBS)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            table
                .remove(key)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        w.commit().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}
