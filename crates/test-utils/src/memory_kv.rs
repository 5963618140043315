use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tillsync_api::KvStore;
use tillsync_types::error::StoreError;

/// A `KvStore` over a plain in-memory map. Per-key writes are atomic by
/// construction.
#[derive(Default)]
pub struct MemoryKv {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// When set, every call fails with a backend error. Lets tests exercise
    /// the local-storage failure path.
    poisoned: Mutex<bool>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poison(&self, on: bool) {
        if let Ok(mut flag) = self.poisoned.lock() {
            *flag = on;
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Copies the entire store, for crash simulations.
    pub fn dump(&self) -> HashMap<String, Vec<u8>> {
        self.blobs.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Replaces the entire store with a previous dump.
    pub fn restore(&self, snapshot: HashMap<String, Vec<u8>>) {
        if let Ok(mut blobs) = self.blobs.lock() {
            *blobs = snapshot;
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        let poisoned = self
            .poisoned
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        if *poisoned {
            return Err(StoreError::Backend("simulated backend failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        Ok(blobs.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        blobs.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?;
        blobs.remove(key);
        Ok(())
    }
}
