//! Device identity, the persisted vector clock, and id generation.

use std::sync::Arc;
use tillsync_api::KvStore;
use tillsync_types::error::StoreError;
use tillsync_types::time::now_ms;
use tillsync_types::{keys, DeviceId, OpId, OperationMeta, Source, VectorClock};
use uuid::Uuid;

/// Owns the stable per-install device id and the device's vector clock.
/// The clock lives in memory with write-through persistence: every bump or
/// merge lands in the durable store before the new value is handed out.
pub struct DeviceClock {
    kv: Arc<dyn KvStore>,
    device_id: DeviceId,
    clock: VectorClock,
}

impl DeviceClock {
    pub async fn load(kv: Arc<dyn KvStore>) -> Result<Self, StoreError> {
        let device_id = match kv.get(keys::DEVICE_ID).await? {
            Some(raw) => String::from_utf8(raw)
                .map_err(|e| StoreError::Decode(format!("device id not utf-8: {e}")))?,
            None => {
                let minted = Uuid::new_v4().to_string();
                kv.put(keys::DEVICE_ID, minted.as_bytes()).await?;
                tracing::info!(target: "clock", device_id = %minted, "minted device id");
                minted
            }
        };

        let clock = match kv.get(keys::VECTOR_CLOCK).await? {
            Some(raw) => serde_json::from_slice(&raw)
                .map_err(|e| StoreError::Decode(format!("vector clock: {e}")))?,
            None => VectorClock::new(),
        };

        Ok(Self {
            kv,
            device_id,
            clock,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.clock
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(&self.clock)
            .map_err(|e| StoreError::Encode(format!("vector clock: {e}")))?;
        self.kv.put(keys::VECTOR_CLOCK, &raw).await
    }

    /// Bumps this device's counter and persists before returning.
    pub async fn increment(&mut self) -> Result<u64, StoreError> {
        let counter = self.clock.bump(&self.device_id);
        self.persist().await?;
        Ok(counter)
    }

    /// Folds a peer clock in (taken from hydrated server rows) so later
    /// local operations causally follow everything this device has seen.
    pub async fn observe(&mut self, other: &VectorClock) -> Result<(), StoreError> {
        if other.0.is_empty() {
            return Ok(());
        }
        self.clock.merge(other);
        self.persist().await
    }

    /// Mints metadata for a new operation: post-bump counter, wall-clock
    /// timestamp, and a snapshot of the full clock.
    pub async fn next_meta(&mut self, source: Source) -> Result<OperationMeta, StoreError> {
        let counter = self.increment().await?;
        Ok(OperationMeta {
            device_id: self.device_id.clone(),
            timestamp: now_ms(),
            version: counter,
            vector_clock: self.clock.clone(),
            source,
        })
    }

    /// Fresh UUIDv4 for free-standing operations, bundles, and entities.
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Deterministic step id: a stable 32-bit hash of `bundle_id:step_name`,
    /// scoped by the bundle id. Retrying a bundle re-derives the exact same
    /// id, which is the idempotency anchor at the remote.
    pub fn step_op_id(bundle_id: &str, step_name: &str) -> OpId {
        let digest = crc32fast::hash(format!("{bundle_id}:{step_name}").as_bytes());
        format!("{bundle_id}:{digest:08x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_test_utils::MemoryKv;

    #[tokio::test]
    async fn test_device_id_is_stable_across_loads() {
        let kv = Arc::new(MemoryKv::new());
        let first = DeviceClock::load(kv.clone()).await.unwrap();
        let second = DeviceClock::load(kv).await.unwrap();
        assert_eq!(first.device_id(), second.device_id());
    }

    #[tokio::test]
    async fn test_clock_persists_across_loads() {
        let kv = Arc::new(MemoryKv::new());
        {
            let mut clock = DeviceClock::load(kv.clone()).await.unwrap();
            assert_eq!(clock.increment().await.unwrap(), 1);
            assert_eq!(clock.increment().await.unwrap(), 2);
        }
        let clock = DeviceClock::load(kv).await.unwrap();
        assert_eq!(clock.vector_clock().get(clock.device_id()), 2);
    }

    #[tokio::test]
    async fn test_next_meta_snapshots_clock() {
        let kv = Arc::new(MemoryKv::new());
        let mut clock = DeviceClock::load(kv).await.unwrap();
        let meta = clock.next_meta(Source::Local).await.unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.vector_clock.get(&meta.device_id), 1);
        let meta2 = clock.next_meta(Source::Local).await.unwrap();
        assert_eq!(meta2.version, 2);
        // The first snapshot must not have moved.
        assert_eq!(meta.vector_clock.get(&meta.device_id), 1);
    }

    #[test]
    fn test_step_op_id_is_deterministic() {
        let a = DeviceClock::step_op_id("b-1", "stockDelta:p1");
        let b = DeviceClock::step_op_id("b-1", "stockDelta:p1");
        let c = DeviceClock::step_op_id("b-2", "stockDelta:p1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("b-1:"));
    }
}
