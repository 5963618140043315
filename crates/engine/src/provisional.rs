//! Uncommitted overlays folded over the base cache on every read.
//!
//! Each overlay is its own persisted blob. Entries are keyed by operation
//! id and inserts deduplicate on it, so replaying a bundle never
//! double-applies. Overlay entries live until the owning bundle (or
//! balance operation) commits, at which point the committer moves the
//! effect into the base cache and removes the entry here.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tillsync_api::KvStore;
use tillsync_types::error::StoreError;
use tillsync_types::{
    keys, Assignment, BundleKind, Charge, Entity, EntityId, Money, OpId, OrganizationSettings,
    Player, Product, TimestampMs,
};

/// A folded row plus the marker telling the UI it contains uncommitted
/// changes.
#[derive(Debug, Clone, PartialEq)]
pub struct WithOverlay<T> {
    pub row: T,
    pub provisional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockDelta {
    pub delta: i64,
    pub op_id: OpId,
    pub timestamp: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceDelta {
    pub delta: Money,
    pub op_id: OpId,
    pub timestamp: TimestampMs,
    /// Which bundle shape produced the delta; `None` for free-standing
    /// balance adjustments. Player totals move only for `AssignmentSale`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_kind: Option<BundleKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionalRow<T> {
    pub row: T,
    pub op_id: OpId,
    pub timestamp: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPatch {
    pub updates: serde_json::Value,
    pub op_id: OpId,
    pub timestamp: TimestampMs,
}

pub struct ProvisionalStore {
    kv: Arc<dyn KvStore>,
    stock: BTreeMap<EntityId, Vec<StockDelta>>,
    balance: BTreeMap<EntityId, Vec<BalanceDelta>>,
    assignments: BTreeMap<EntityId, ProvisionalRow<Assignment>>,
    assignment_updates: BTreeMap<EntityId, Vec<FieldPatch>>,
    organization_updates: Vec<FieldPatch>,
    charges: BTreeMap<EntityId, ProvisionalRow<Charge>>,
}

impl ProvisionalStore {
    pub async fn load(kv: Arc<dyn KvStore>) -> Result<Self, StoreError> {
        Ok(Self {
            stock: read_blob(&kv, keys::PROVISIONAL_STOCK_DELTAS).await?,
            balance: read_blob(&kv, keys::PROVISIONAL_BALANCE_DELTAS).await?,
            assignments: read_blob(&kv, keys::PROVISIONAL_ASSIGNMENTS).await?,
            assignment_updates: read_blob(&kv, keys::PROVISIONAL_ASSIGNMENT_UPDATES).await?,
            organization_updates: read_blob(&kv, keys::PROVISIONAL_ORGANIZATION_UPDATES).await?,
            charges: read_blob(&kv, keys::PROVISIONAL_CHARGES).await?,
            kv,
        })
    }

    // ---- overlay inserts (all deduplicate by op id) ----

    pub async fn add_stock_delta(
        &mut self,
        product_id: &str,
        delta: StockDelta,
    ) -> Result<bool, StoreError> {
        let entries = self.stock.entry(product_id.to_string()).or_default();
        if entries.iter().any(|e| e.op_id == delta.op_id) {
            return Ok(false);
        }
        entries.push(delta);
        self.save(keys::PROVISIONAL_STOCK_DELTAS, &self.stock).await?;
        Ok(true)
    }

    pub async fn add_balance_delta(
        &mut self,
        player_id: &str,
        delta: BalanceDelta,
    ) -> Result<bool, StoreError> {
        let entries = self.balance.entry(player_id.to_string()).or_default();
        if entries.iter().any(|e| e.op_id == delta.op_id) {
            return Ok(false);
        }
        entries.push(delta);
        self.save(keys::PROVISIONAL_BALANCE_DELTAS, &self.balance)
            .await?;
        Ok(true)
    }

    pub async fn add_assignment(
        &mut self,
        row: ProvisionalRow<Assignment>,
    ) -> Result<bool, StoreError> {
        let id = row.row.id().clone();
        if let Some(existing) = self.assignments.get(&id) {
            if existing.op_id == row.op_id {
                return Ok(false);
            }
        }
        self.assignments.insert(id, row);
        self.save(keys::PROVISIONAL_ASSIGNMENTS, &self.assignments)
            .await?;
        Ok(true)
    }

    pub async fn add_assignment_update(
        &mut self,
        assignment_id: &str,
        patch: FieldPatch,
    ) -> Result<bool, StoreError> {
        let entries = self
            .assignment_updates
            .entry(assignment_id.to_string())
            .or_default();
        if entries.iter().any(|e| e.op_id == patch.op_id) {
            return Ok(false);
        }
        entries.push(patch);
        self.save(keys::PROVISIONAL_ASSIGNMENT_UPDATES, &self.assignment_updates)
            .await?;
        Ok(true)
    }

    pub async fn add_organization_update(&mut self, patch: FieldPatch) -> Result<bool, StoreError> {
        if self
            .organization_updates
            .iter()
            .any(|e| e.op_id == patch.op_id)
        {
            return Ok(false);
        }
        self.organization_updates.push(patch);
        self.save(
            keys::PROVISIONAL_ORGANIZATION_UPDATES,
            &self.organization_updates,
        )
        .await?;
        Ok(true)
    }

    pub async fn add_charge(&mut self, row: ProvisionalRow<Charge>) -> Result<bool, StoreError> {
        let id = row.row.id().clone();
        if let Some(existing) = self.charges.get(&id) {
            if existing.op_id == row.op_id {
                return Ok(false);
            }
        }
        self.charges.insert(id, row);
        self.save(keys::PROVISIONAL_CHARGES, &self.charges).await?;
        Ok(true)
    }

    // ---- folds ----

    pub fn fold_products(&self, base: &[Product]) -> Vec<WithOverlay<Product>> {
        base.iter()
            .map(|product| {
                let mut row = product.clone();
                let mut provisional = false;
                if let Some(deltas) = self.stock.get(row.id()) {
                    if !deltas.is_empty() {
                        provisional = true;
                        row.stock += deltas.iter().map(|d| d.delta).sum::<i64>();
                    }
                }
                WithOverlay { row, provisional }
            })
            .collect()
    }

    pub fn fold_players(&self, base: &[Player]) -> Vec<WithOverlay<Player>> {
        base.iter()
            .map(|player| {
                let mut row = player.clone();
                let mut provisional = false;
                if let Some(deltas) = self.balance.get(row.id()) {
                    if !deltas.is_empty() {
                        provisional = true;
                        for delta in deltas {
                            row.balance += delta.delta;
                            if delta.bundle_kind == Some(BundleKind::AssignmentSale)
                                && delta.delta > 0
                            {
                                row.total_spent += delta.delta;
                                row.total_purchases += 1;
                            }
                        }
                    }
                }
                WithOverlay { row, provisional }
            })
            .collect()
    }

    pub fn fold_assignments(&self, base: &[Assignment]) -> Vec<WithOverlay<Assignment>> {
        let mut out: Vec<WithOverlay<Assignment>> = base
            .iter()
            .map(|assignment| {
                let mut row = assignment.clone();
                let mut provisional = false;
                if let Some(patches) = self.assignment_updates.get(row.id()) {
                    for patch in patches {
                        provisional = true;
                        if let Err(e) = row.merge_fields(&patch.updates) {
                            tracing::warn!(target: "provisional", error = %e, id = %row.id(), "bad assignment patch");
                        }
                    }
                }
                WithOverlay { row, provisional }
            })
            .collect();

        let base_ids: HashSet<&EntityId> = base.iter().map(|a| a.id()).collect();
        for pending in self.assignments.values() {
            if !base_ids.contains(pending.row.id()) {
                let mut row = pending.row.clone();
                if let Some(patches) = self.assignment_updates.get(row.id()) {
                    for patch in patches {
                        if let Err(e) = row.merge_fields(&patch.updates) {
                            tracing::warn!(target: "provisional", error = %e, id = %row.id(), "bad assignment patch");
                        }
                    }
                }
                out.push(WithOverlay {
                    row,
                    provisional: true,
                });
            }
        }
        out
    }

    pub fn fold_charges(&self, base: &[Charge]) -> Vec<WithOverlay<Charge>> {
        let mut out: Vec<WithOverlay<Charge>> = base
            .iter()
            .map(|charge| WithOverlay {
                row: charge.clone(),
                provisional: false,
            })
            .collect();
        let base_ids: HashSet<&EntityId> = base.iter().map(|c| c.id()).collect();
        for pending in self.charges.values() {
            if !base_ids.contains(pending.row.id()) {
                out.push(WithOverlay {
                    row: pending.row.clone(),
                    provisional: true,
                });
            }
        }
        out
    }

    /// Shallow-merges pending organization updates in insertion order.
    pub fn fold_organization(
        &self,
        base: Option<OrganizationSettings>,
    ) -> Option<WithOverlay<OrganizationSettings>> {
        let mut row = base?;
        let mut provisional = false;
        for patch in &self.organization_updates {
            provisional = true;
            if let Err(e) = row.merge_fields(&patch.updates) {
                tracing::warn!(target: "provisional", error = %e, "bad organization patch");
            }
        }
        Some(WithOverlay { row, provisional })
    }

    // ---- lifecycle ----

    /// Drops every overlay entry belonging to the given operation ids.
    /// Called by the committer once those operations are durably applied
    /// at the remote and folded into the base cache.
    pub async fn remove_ops(&mut self, op_ids: &HashSet<OpId>) -> Result<(), StoreError> {
        if op_ids.is_empty() {
            return Ok(());
        }

        for entries in self.stock.values_mut() {
            entries.retain(|d| !op_ids.contains(&d.op_id));
        }
        self.stock.retain(|_, entries| !entries.is_empty());

        for entries in self.balance.values_mut() {
            entries.retain(|d| !op_ids.contains(&d.op_id));
        }
        self.balance.retain(|_, entries| !entries.is_empty());

        self.assignments.retain(|_, row| !op_ids.contains(&row.op_id));

        for entries in self.assignment_updates.values_mut() {
            entries.retain(|p| !op_ids.contains(&p.op_id));
        }
        self.assignment_updates
            .retain(|_, entries| !entries.is_empty());

        self.organization_updates
            .retain(|p| !op_ids.contains(&p.op_id));

        self.charges.retain(|_, row| !op_ids.contains(&row.op_id));

        self.save_all().await
    }

    /// Entity ids that have any uncommitted overlay entry. The hydrator
    /// must not treat these as remotely deleted.
    pub fn pending_entity_ids(&self) -> HashSet<EntityId> {
        let mut ids: HashSet<EntityId> = HashSet::new();
        ids.extend(self.assignments.keys().cloned());
        ids.extend(self.charges.keys().cloned());
        ids.extend(self.stock.keys().cloned());
        ids.extend(self.balance.keys().cloned());
        ids.extend(self.assignment_updates.keys().cloned());
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.stock.is_empty()
            && self.balance.is_empty()
            && self.assignments.is_empty()
            && self.assignment_updates.is_empty()
            && self.organization_updates.is_empty()
            && self.charges.is_empty()
    }

    async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| StoreError::Encode(format!("overlay {key}: {e}")))?;
        self.kv.put(key, &raw).await
    }

    async fn save_all(&self) -> Result<(), StoreError> {
        self.save(keys::PROVISIONAL_STOCK_DELTAS, &self.stock).await?;
        self.save(keys::PROVISIONAL_BALANCE_DELTAS, &self.balance)
            .await?;
        self.save(keys::PROVISIONAL_ASSIGNMENTS, &self.assignments)
            .await?;
        self.save(keys::PROVISIONAL_ASSIGNMENT_UPDATES, &self.assignment_updates)
            .await?;
        self.save(
            keys::PROVISIONAL_ORGANIZATION_UPDATES,
            &self.organization_updates,
        )
        .await?;
        self.save(keys::PROVISIONAL_CHARGES, &self.charges).await
    }
}

async fn read_blob<T: serde::de::DeserializeOwned + Default>(
    kv: &Arc<dyn KvStore>,
    key: &str,
) -> Result<T, StoreError> {
    match kv.get(key).await? {
        Some(raw) => serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Decode(format!("overlay {key}: {e}"))),
        None => Ok(T::default()),
    }
}
