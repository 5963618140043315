//! API for the durable local store: string-keyed opaque blobs.

use async_trait::async_trait;
use tillsync_types::error::StoreError;

/// A durable, string-keyed blob store.
///
/// Writes must be atomic per key: a partially written collection blob is a
/// corruption the engine cannot recover from. The engine serialises all
/// access through its own state lock, so implementations only need per-call
/// atomicity, not cross-call transactions.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Removing an absent key is a no-op, not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
