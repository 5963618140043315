//! Engine status surfaced to the host UI.

use serde::{Deserialize, Serialize};
use tillsync_types::TimestampMs;

/// A point-in-time summary of the sync engine, for "N changes pending"
/// indicators and for blocking unsafe logout while writes are queued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub main_queue_length: usize,
    pub dead_letter_queue_length: usize,
    pub pending_bundles: usize,
    /// Age of the oldest queued operation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_operation_age_ms: Option<TimestampMs>,
}
