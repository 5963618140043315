//! Atomic multi-step transactions. A bundle groups the writes of one
//! business intent (a sale, a payment, a charge) so they commit together at
//! the remote, with per-step ids stable across retries.

use crate::clock::VectorClock;
use crate::{ChargeStatus, Charge, Assignment, EntityId, Money, OpId, Source, TimestampMs};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The six bundle shapes the engine produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BundleKind {
    AssignmentSale,
    Charge,
    PlayerPayment,
    ChargeUpdate,
    ChargeDelete,
    OrganizationUpdate,
}

/// Reference from a bundle to the entities it touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    One(EntityId),
    Many(Vec<EntityId>),
}

/// One step inside a bundle. A closed sum: the provisional overlay, the
/// local committer, and the remote applier each match exhaustively, so a new
/// step kind cannot be half-wired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum StepKind {
    CreateAssignment {
        assignment: Assignment,
    },
    StockDelta {
        product_id: EntityId,
        delta: i64,
    },
    BalanceDelta {
        player_id: EntityId,
        delta: Money,
        /// Which bundle shape produced the delta. Player totals increment
        /// only for `AssignmentSale` deltas.
        bundle_kind: BundleKind,
    },
    UpdateAssignment {
        assignment_id: EntityId,
        updates: serde_json::Value,
    },
    CreateCharge {
        charge: Charge,
    },
    UpdateCharge {
        charge_id: EntityId,
        status: ChargeStatus,
    },
    DeleteCharge {
        charge_id: EntityId,
    },
    UpdateOrganization {
        updates: serde_json::Value,
    },
}

impl StepKind {
    /// Human-readable step label, also used as the deterministic id seed.
    pub fn name(&self) -> String {
        match self {
            StepKind::CreateAssignment { assignment } => {
                format!("createAssignment:{}", assignment.id)
            }
            StepKind::StockDelta { product_id, .. } => format!("stockDelta:{product_id}"),
            StepKind::BalanceDelta { player_id, .. } => format!("balanceDelta:{player_id}"),
            StepKind::UpdateAssignment { assignment_id, .. } => {
                format!("updateAssignment:{assignment_id}")
            }
            StepKind::CreateCharge { charge } => format!("createCharge:{}", charge.id),
            StepKind::UpdateCharge { charge_id, .. } => format!("updateCharge:{charge_id}"),
            StepKind::DeleteCharge { charge_id } => format!("deleteCharge:{charge_id}"),
            StepKind::UpdateOrganization { .. } => "updateOrganization".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleStep {
    /// Stable hash of `(bundle_id, step_name)`. Retrying the bundle re-mints
    /// the same id, which is what makes retries idempotent at the remote.
    pub op_id: OpId,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// An atomic group of steps sharing one `bundle_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub bundle_id: String,
    pub kind: BundleKind,
    #[serde(default)]
    pub entity_refs: BTreeMap<String, EntityRef>,
    pub steps: Vec<BundleStep>,
    pub vector_clock: VectorClock,
    pub timestamp: TimestampMs,
    pub source: Source,
}

impl Bundle {
    pub fn step_op_ids(&self) -> Vec<OpId> {
        self.steps.iter().map(|s| s.op_id.clone()).collect()
    }
}

/// Acknowledgement for one step after a remote application attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAck {
    pub op_id: OpId,
    /// True when the remote already had the op recorded and skipped it.
    pub skipped: bool,
}

/// A bundle awaiting remote application, persisted in `pending_bundles`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingBundle {
    pub bundle: Bundle,
    pub enqueued_at: TimestampMs,
    #[serde(default)]
    pub attempts: u32,
}
