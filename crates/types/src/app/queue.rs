//! Outbox and dead-letter records: the durable FIFO of operations awaiting
//! remote application.

use crate::{Collection, EntityId, OpId, OperationKind, TimestampMs};
use serde::{Deserialize, Serialize};

/// One pending remote write in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: OpId,
    pub action: OperationKind,
    pub collection: Collection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    pub data: serde_json::Value,
    /// Enqueue time. Drives FIFO order and the stale-item expiry filter.
    pub timestamp: TimestampMs,
    /// Earliest time the item may be attempted again (backoff schedule).
    #[serde(default)]
    pub next_attempt_at: TimestampMs,
    /// Attempts that failed with a real (4xx-semantic) error.
    #[serde(default)]
    pub retry_count: u32,
    /// Attempts that failed with a network-class error. Budgeted separately
    /// and far more generously.
    #[serde(default)]
    pub network_retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_label: Option<String>,
}

impl SyncQueueItem {
    /// Duplicate detection triple: two queue entries with the same id,
    /// collection, and action are the same logical write.
    pub fn dedup_key(&self) -> (&str, Collection, OperationKind) {
        (self.id.as_str(), self.collection, self.action)
    }
}

/// An outbox item that exhausted its real-failure retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterItem {
    #[serde(flatten)]
    pub item: SyncQueueItem,
    pub failed_at: TimestampMs,
    pub last_error: String,
}
