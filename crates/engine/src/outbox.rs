//! The outbox: a durable FIFO of pending remote writes, its dead-letter
//! companion, the pending-bundle queue, and the processed-id ledger.

use crate::config::EngineConfig;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tillsync_api::{FailureClass, KvStore};
use tillsync_types::error::StoreError;
use tillsync_types::{
    keys, BundleKind, Collection, DeadLetterItem, EntityId, OpId, OperationKind, PendingBundle,
    SyncQueueItem, TimestampMs,
};

/// What `record_failure` decided about an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Still in the queue, scheduled for another attempt.
    Retained,
    /// Real-failure budget exhausted; moved to the dead-letter queue.
    DeadLettered,
    /// The device is offline; nothing was counted against the item.
    Skipped,
}

pub struct Outbox {
    kv: Arc<dyn KvStore>,
    queue: Vec<SyncQueueItem>,
    dlq: Vec<DeadLetterItem>,
    pending_bundles: Vec<PendingBundle>,
    /// Insertion-ordered so trimming drops the oldest ids first.
    processed: Vec<OpId>,
    processed_set: HashSet<OpId>,
}

impl Outbox {
    pub async fn load(kv: Arc<dyn KvStore>) -> Result<Self, StoreError> {
        let queue = read_list(&kv, keys::SYNC_QUEUE).await?;
        let dlq = read_list(&kv, keys::DEAD_LETTER_QUEUE).await?;
        let pending_bundles = read_list(&kv, keys::PENDING_BUNDLES).await?;
        let processed: Vec<OpId> = read_list(&kv, keys::PROCESSED_IDS).await?;
        let processed_set = processed.iter().cloned().collect();
        Ok(Self {
            kv,
            queue,
            dlq,
            pending_bundles,
            processed,
            processed_set,
        })
    }

    /// Load-time hygiene: drops structurally invalid items, updates whose
    /// entity no longer exists locally, and stale items that already burned
    /// half their retry budget. Returns how many were dropped.
    pub async fn filter_on_load(
        &mut self,
        known_ids: &HashMap<Collection, HashSet<EntityId>>,
        now: TimestampMs,
        config: &EngineConfig,
    ) -> Result<usize, StoreError> {
        let before = self.queue.len();
        let half_budget = config.max_retries.div_ceil(2);
        self.queue.retain(|item| {
            if item.id.is_empty() {
                tracing::warn!(target: "outbox", "dropping queue item with empty id");
                return false;
            }
            if matches!(
                item.action,
                OperationKind::Update | OperationKind::UpdateBalance
            ) {
                let Some(entity_id) = item.entity_id.as_deref() else {
                    tracing::warn!(target: "outbox", id = %item.id, "dropping update with no entity id");
                    return false;
                };
                let exists = known_ids
                    .get(&item.collection)
                    .map(|ids| ids.contains(entity_id))
                    .unwrap_or(false);
                if !exists {
                    tracing::info!(
                        target: "outbox",
                        id = %item.id,
                        entity_id,
                        collection = %item.collection,
                        "dropping orphaned queue item"
                    );
                    return false;
                }
            }
            if now - item.timestamp > config.outbox_expiry_ms && item.retry_count >= half_budget {
                tracing::warn!(target: "outbox", id = %item.id, "dropping expired queue item");
                return false;
            }
            true
        });
        let dropped = before - self.queue.len();
        if dropped > 0 {
            self.save_queue().await?;
        }
        Ok(dropped)
    }

    /// FIFO insert. Duplicate `(id, collection, action)` triples are
    /// rejected, which is what makes re-applying an operation harmless.
    pub async fn enqueue(&mut self, item: SyncQueueItem) -> Result<bool, StoreError> {
        if self.queue.iter().any(|q| q.dedup_key() == item.dedup_key()) {
            return Ok(false);
        }
        self.queue.push(item);
        self.save_queue().await?;
        Ok(true)
    }

    /// Success path: removes the item and records its id as processed, in
    /// one save.
    pub async fn complete(&mut self, op_id: &str) -> Result<(), StoreError> {
        self.queue.retain(|q| q.id != op_id);
        if self.processed_set.insert(op_id.to_string()) {
            self.processed.push(op_id.to_string());
        }
        self.save_queue().await?;
        self.save_processed().await
    }

    /// Rolls back processed-id additions after a failed batch.
    pub async fn unmark_processed(&mut self, op_ids: &[OpId]) -> Result<(), StoreError> {
        if op_ids.is_empty() {
            return Ok(());
        }
        for id in op_ids {
            self.processed_set.remove(id);
        }
        self.processed.retain(|id| self.processed_set.contains(id));
        self.save_processed().await
    }

    pub fn is_processed(&self, op_id: &str) -> bool {
        self.processed_set.contains(op_id)
    }

    /// Items eligible for a drain attempt, oldest first.
    pub fn due_items(&self, now: TimestampMs) -> Vec<SyncQueueItem> {
        let mut due: Vec<SyncQueueItem> = self
            .queue
            .iter()
            .filter(|q| q.next_attempt_at <= now && !self.processed_set.contains(&q.id))
            .cloned()
            .collect();
        due.sort_by_key(|q| q.timestamp);
        due
    }

    /// Applies retry accounting after a failed attempt.
    pub async fn record_failure(
        &mut self,
        op_id: &str,
        class: FailureClass,
        error_text: &str,
        online: bool,
        config: &EngineConfig,
        now: TimestampMs,
    ) -> Result<FailureDisposition, StoreError> {
        // A device that is offline learned nothing about the item.
        if !online {
            return Ok(FailureDisposition::Skipped);
        }

        let Some(index) = self.queue.iter().position(|q| q.id == op_id) else {
            return Ok(FailureDisposition::Skipped);
        };

        let disposition = {
            let Some(item) = self.queue.get_mut(index) else {
                return Ok(FailureDisposition::Skipped);
            };
            match class {
                FailureClass::Real => {
                    item.retry_count += 1;
                    if item.retry_count >= config.max_retries {
                        FailureDisposition::DeadLettered
                    } else {
                        item.next_attempt_at =
                            now + real_backoff(config, item.retry_count).as_millis() as i64;
                        FailureDisposition::Retained
                    }
                }
                FailureClass::Network => {
                    item.network_retry_count += 1;
                    // Network failures never dead-letter: the link is the
                    // problem, not the item. The generous budget only bounds
                    // how often it is attempted.
                    let capped = item.network_retry_count.min(config.max_network_retries);
                    item.next_attempt_at = now + network_backoff(config, capped).as_millis() as i64;
                    FailureDisposition::Retained
                }
            }
        };

        if disposition == FailureDisposition::DeadLettered {
            let item = self.queue.remove(index);
            tracing::warn!(
                target: "outbox",
                id = %item.id,
                retry_count = item.retry_count,
                error = error_text,
                "retry budget exhausted, dead-lettering"
            );
            self.dlq.push(DeadLetterItem {
                item,
                failed_at: now,
                last_error: error_text.to_string(),
            });
            self.save_dlq().await?;
        }
        self.save_queue().await?;
        Ok(disposition)
    }

    /// Moves dead-letter items back into the queue with reset counters.
    /// `min_age: None` resurrects everything (the reconnect path);
    /// `Some(age)` only items that have sat long enough (the reaper).
    pub async fn resurrect_dlq(
        &mut self,
        min_age: Option<Duration>,
        now: TimestampMs,
    ) -> Result<usize, StoreError> {
        let cutoff = min_age.map(|age| now - age.as_millis() as i64);
        let (eligible, rest): (Vec<DeadLetterItem>, Vec<DeadLetterItem>) = self
            .dlq
            .drain(..)
            .partition(|d| cutoff.map(|c| d.failed_at <= c).unwrap_or(true));
        self.dlq = rest;

        let count = eligible.len();
        for dead in eligible {
            let mut item = dead.item;
            item.retry_count = 0;
            item.network_retry_count = 0;
            item.next_attempt_at = now;
            if !self.queue.iter().any(|q| q.dedup_key() == item.dedup_key()) {
                self.queue.push(item);
            }
        }
        if count > 0 {
            self.save_queue().await?;
            self.save_dlq().await?;
            tracing::info!(target: "outbox", count, "resurrected dead-letter items");
        }
        Ok(count)
    }

    // ---- pending bundles ----

    pub async fn push_bundle(&mut self, bundle: PendingBundle) -> Result<(), StoreError> {
        if self
            .pending_bundles
            .iter()
            .any(|b| b.bundle.bundle_id == bundle.bundle.bundle_id)
        {
            return Ok(());
        }
        self.pending_bundles.push(bundle);
        self.save_bundles().await
    }

    pub async fn remove_bundle(&mut self, bundle_id: &str) -> Result<(), StoreError> {
        self.pending_bundles
            .retain(|b| b.bundle.bundle_id != bundle_id);
        self.save_bundles().await
    }

    pub async fn bump_bundle_attempts(&mut self, bundle_id: &str) -> Result<(), StoreError> {
        if let Some(bundle) = self
            .pending_bundles
            .iter_mut()
            .find(|b| b.bundle.bundle_id == bundle_id)
        {
            bundle.attempts += 1;
        }
        self.save_bundles().await
    }

    pub fn pending_bundles(&self) -> &[PendingBundle] {
        &self.pending_bundles
    }

    // ---- bookkeeping ----

    /// Caps the processed-id ledger: beyond `cap` entries the oldest are
    /// dropped until `trim` remain.
    pub async fn trim_processed(&mut self, config: &EngineConfig) -> Result<(), StoreError> {
        if self.processed.len() <= config.processed_ids_cap {
            return Ok(());
        }
        let excess = self.processed.len() - config.processed_ids_trim;
        for id in self.processed.drain(..excess) {
            self.processed_set.remove(&id);
        }
        self.save_processed().await
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn dlq_len(&self) -> usize {
        self.dlq.len()
    }

    pub fn bundle_len(&self) -> usize {
        self.pending_bundles.len()
    }

    pub fn queue_items(&self) -> &[SyncQueueItem] {
        &self.queue
    }

    /// Age of the oldest queued work, if any.
    pub fn oldest_age_ms(&self, now: TimestampMs) -> Option<TimestampMs> {
        let oldest_item = self.queue.iter().map(|q| q.timestamp).min();
        let oldest_bundle = self.pending_bundles.iter().map(|b| b.enqueued_at).min();
        let oldest = match (oldest_item, oldest_bundle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }?;
        Some((now - oldest).max(0))
    }

    /// Entity ids referenced by queued work; protected from hydrator
    /// deletion sweeps.
    pub fn referenced_entity_ids(&self) -> HashSet<EntityId> {
        self.queue
            .iter()
            .filter_map(|q| q.entity_id.clone())
            .collect()
    }

    /// High-priority work: assignment flag updates, balance movements, and
    /// organization settings — the changes a peer device should see within
    /// seconds.
    pub fn has_high_priority_work(&self) -> bool {
        let item_priority = self.queue.iter().any(|q| {
            q.action == OperationKind::UpdateBalance
                || (q.collection == Collection::Assignments && q.action == OperationKind::Update)
                || q.collection == Collection::Organizations
        });
        let bundle_priority = self.pending_bundles.iter().any(|b| {
            matches!(
                b.bundle.kind,
                BundleKind::PlayerPayment | BundleKind::ChargeUpdate | BundleKind::OrganizationUpdate
            )
        });
        item_priority || bundle_priority
    }

    async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| StoreError::Encode(format!("outbox {key}: {e}")))?;
        self.kv.put(key, &raw).await
    }

    async fn save_queue(&self) -> Result<(), StoreError> {
        self.save(keys::SYNC_QUEUE, &self.queue).await
    }

    async fn save_dlq(&self) -> Result<(), StoreError> {
        self.save(keys::DEAD_LETTER_QUEUE, &self.dlq).await
    }

    async fn save_bundles(&self) -> Result<(), StoreError> {
        self.save(keys::PENDING_BUNDLES, &self.pending_bundles).await
    }

    async fn save_processed(&self) -> Result<(), StoreError> {
        self.save(keys::PROCESSED_IDS, &self.processed).await
    }
}

/// Real-failure backoff: `min(base * 2^n, cap)`.
pub fn real_backoff(config: &EngineConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let delay = config.real_backoff_base.saturating_mul(1u32 << exp);
    delay.min(config.real_backoff_cap)
}

/// Network-failure backoff: `min(base * 1.5^n, cap)` — gentler, because the
/// item is innocent.
pub fn network_backoff(config: &EngineConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(63);
    let factor = 1.5f64.powi(exp as i32);
    let delay = config.network_backoff_base.as_secs_f64() * factor;
    Duration::from_secs_f64(delay.min(config.network_backoff_cap.as_secs_f64()))
}

async fn read_list<T: serde::de::DeserializeOwned>(
    kv: &Arc<dyn KvStore>,
    key: &str,
) -> Result<Vec<T>, StoreError> {
    match kv.get(key).await? {
        Some(raw) => serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Decode(format!("outbox {key}: {e}"))),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tillsync_test_utils::MemoryKv;

    fn item(id: &str, collection: Collection, action: OperationKind) -> SyncQueueItem {
        SyncQueueItem {
            id: id.into(),
            action,
            collection,
            entity_id: Some(format!("e-{id}")),
            data: json!({}),
            timestamp: 1_000,
            next_attempt_at: 0,
            retry_count: 0,
            network_retry_count: 0,
            batch_id: None,
            batch_label: None,
        }
    }

    async fn outbox() -> Outbox {
        Outbox::load(Arc::new(MemoryKv::new())).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_rejects_duplicate_triple() {
        let mut outbox = outbox().await;
        assert!(outbox
            .enqueue(item("a", Collection::Products, OperationKind::Update))
            .await
            .unwrap());
        assert!(!outbox
            .enqueue(item("a", Collection::Products, OperationKind::Update))
            .await
            .unwrap());
        // Same id, different action: a distinct logical write.
        assert!(outbox
            .enqueue(item("a", Collection::Products, OperationKind::Delete))
            .await
            .unwrap());
        assert_eq!(outbox.queue_len(), 2);
    }

    #[tokio::test]
    async fn test_complete_removes_and_marks_processed() {
        let mut outbox = outbox().await;
        outbox
            .enqueue(item("a", Collection::Products, OperationKind::Update))
            .await
            .unwrap();
        outbox.complete("a").await.unwrap();
        assert_eq!(outbox.queue_len(), 0);
        assert!(outbox.is_processed("a"));
        assert!(outbox.due_items(10_000).is_empty());
    }

    #[tokio::test]
    async fn test_real_failures_dead_letter_at_budget() {
        let mut outbox = outbox().await;
        let config = EngineConfig::default();
        outbox
            .enqueue(item("a", Collection::Products, OperationKind::Update))
            .await
            .unwrap();

        for attempt in 1..config.max_retries {
            let disposition = outbox
                .record_failure("a", FailureClass::Real, "conflict", true, &config, 5_000)
                .await
                .unwrap();
            assert_eq!(disposition, FailureDisposition::Retained, "attempt {attempt}");
        }
        let disposition = outbox
            .record_failure("a", FailureClass::Real, "conflict", true, &config, 5_000)
            .await
            .unwrap();
        assert_eq!(disposition, FailureDisposition::DeadLettered);
        assert_eq!(outbox.queue_len(), 0);
        assert_eq!(outbox.dlq_len(), 1);
    }

    #[tokio::test]
    async fn test_network_failures_never_dead_letter() {
        let mut outbox = outbox().await;
        let config = EngineConfig::default();
        outbox
            .enqueue(item("a", Collection::Products, OperationKind::Update))
            .await
            .unwrap();

        for _ in 0..20 {
            let disposition = outbox
                .record_failure("a", FailureClass::Network, "timeout", true, &config, 5_000)
                .await
                .unwrap();
            assert_eq!(disposition, FailureDisposition::Retained);
        }
        assert_eq!(outbox.queue_len(), 1);
        assert_eq!(outbox.dlq_len(), 0);
    }

    #[tokio::test]
    async fn test_offline_failures_count_nothing() {
        let mut outbox = outbox().await;
        let config = EngineConfig::default();
        outbox
            .enqueue(item("a", Collection::Products, OperationKind::Update))
            .await
            .unwrap();

        let disposition = outbox
            .record_failure("a", FailureClass::Real, "conn", false, &config, 5_000)
            .await
            .unwrap();
        assert_eq!(disposition, FailureDisposition::Skipped);
        let items = outbox.due_items(10_000);
        assert_eq!(items.len(), 1);
        assert_eq!(items.first().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_resurrect_all_resets_counters() {
        let mut outbox = outbox().await;
        let config = EngineConfig::default();
        outbox
            .enqueue(item("a", Collection::Products, OperationKind::Update))
            .await
            .unwrap();
        for _ in 0..config.max_retries {
            outbox
                .record_failure("a", FailureClass::Real, "conflict", true, &config, 5_000)
                .await
                .unwrap();
        }
        assert_eq!(outbox.dlq_len(), 1);

        // Resurrecting an empty set is a no-op; everything comes back here.
        assert_eq!(outbox.resurrect_dlq(None, 6_000).await.unwrap(), 1);
        assert_eq!(outbox.resurrect_dlq(None, 6_000).await.unwrap(), 0);
        assert_eq!(outbox.dlq_len(), 0);
        let items = outbox.due_items(10_000);
        assert_eq!(items.first().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_reaper_respects_min_age() {
        let mut outbox = outbox().await;
        let config = EngineConfig::default();
        outbox
            .enqueue(item("a", Collection::Products, OperationKind::Update))
            .await
            .unwrap();
        for _ in 0..config.max_retries {
            outbox
                .record_failure("a", FailureClass::Real, "conflict", true, &config, 100_000)
                .await
                .unwrap();
        }

        let hour = Duration::from_secs(3600);
        // Too fresh to resurrect.
        assert_eq!(
            outbox.resurrect_dlq(Some(hour), 100_000 + 60_000).await.unwrap(),
            0
        );
        // Old enough now.
        assert_eq!(
            outbox
                .resurrect_dlq(Some(hour), 100_000 + 3_600_001)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_filter_drops_orphans_and_keeps_deletes() {
        let kv = Arc::new(MemoryKv::new());
        let mut outbox = Outbox::load(kv).await.unwrap();
        let config = EngineConfig::default();

        let mut orphan = item("gone", Collection::Products, OperationKind::Update);
        orphan.entity_id = Some("p-gone".into());
        outbox.enqueue(orphan).await.unwrap();
        let mut delete = item("del", Collection::Products, OperationKind::Delete);
        delete.entity_id = Some("p-gone".into());
        outbox.enqueue(delete).await.unwrap();

        let known: HashMap<Collection, HashSet<EntityId>> = HashMap::new();
        let dropped = outbox.filter_on_load(&known, 2_000, &config).await.unwrap();

        // The update is orphaned; the delete must survive — its entity was
        // removed locally by the very operation being synced.
        assert_eq!(dropped, 1);
        assert_eq!(outbox.queue_len(), 1);
        assert_eq!(
            outbox.due_items(10_000).first().unwrap().action,
            OperationKind::Delete
        );
    }

    #[tokio::test]
    async fn test_trim_processed_caps_ledger() {
        let mut outbox = outbox().await;
        let config = EngineConfig {
            processed_ids_cap: 10,
            processed_ids_trim: 5,
            ..EngineConfig::default()
        };
        for i in 0..12 {
            outbox
                .enqueue(item(&format!("i{i}"), Collection::Products, OperationKind::Update))
                .await
                .unwrap();
            outbox.complete(&format!("i{i}")).await.unwrap();
        }
        outbox.trim_processed(&config).await.unwrap();
        assert!(!outbox.is_processed("i0"));
        assert!(outbox.is_processed("i11"));
    }

    #[tokio::test]
    async fn test_backoff_schedules() {
        let config = EngineConfig::default();
        assert_eq!(real_backoff(&config, 1), Duration::from_secs(1));
        assert_eq!(real_backoff(&config, 2), Duration::from_secs(2));
        assert_eq!(real_backoff(&config, 3), Duration::from_secs(4));
        // Capped at five minutes.
        assert_eq!(real_backoff(&config, 30), Duration::from_secs(300));

        assert_eq!(network_backoff(&config, 1), Duration::from_secs(5));
        assert!(network_backoff(&config, 2) > network_backoff(&config, 1));
        // Capped at one minute.
        assert_eq!(network_backoff(&config, 40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let kv = Arc::new(MemoryKv::new());
        {
            let mut outbox = Outbox::load(kv.clone()).await.unwrap();
            outbox
                .enqueue(item("a", Collection::Players, OperationKind::UpdateBalance))
                .await
                .unwrap();
            outbox.complete("b").await.unwrap();
        }
        let outbox = Outbox::load(kv).await.unwrap();
        assert_eq!(outbox.queue_len(), 1);
        assert!(outbox.is_processed("b"));
        assert!(outbox.has_high_priority_work());
    }
}
