//! The canonical mutation record. Every state change in the engine — local
//! writes, hydrated server rows, replayed queue items — funnels through one
//! `Operation`.

use crate::clock::VectorClock;
use crate::{Collection, DeviceId, EntityId, OpId, TimestampMs};
use serde::{Deserialize, Serialize};

/// What an operation does to its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Balance mutation. Deliberately has no direct cache effect in the
    /// applier: pre-commit visibility comes from the provisional balance
    /// overlay, post-commit visibility from the bundle committer.
    UpdateBalance,
    /// Compound sale write: assignment row, stock decrement, player totals.
    CreateAssignmentTransaction,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::UpdateBalance => "updateBalance",
            OperationKind::CreateAssignmentTransaction => "createAssignmentTransaction",
        }
    }
}

/// Where an operation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
    /// Produced by this device's public API.
    Local,
    /// Produced by the hydrator from a remote snapshot.
    Server,
    /// Replayed from the outbox during a drain.
    Sync,
}

/// Metadata attached to every operation: who, when, and the causal context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMeta {
    pub device_id: DeviceId,
    pub timestamp: TimestampMs,
    /// This device's post-bump counter at mint time.
    pub version: u64,
    pub vector_clock: VectorClock,
    pub source: Source,
}

/// The atomic unit of state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OpId,
    pub kind: OperationKind,
    pub collection: Collection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    /// Opaque payload; decoded per collection by the applier.
    pub data: serde_json::Value,
    pub metadata: OperationMeta,
}
