//! The bundle engine: builds atomic multi-step transactions, stages them in
//! the provisional overlays, applies them remotely under applied-ops
//! idempotency guards, and commits the results into the base cache.

use crate::clock::DeviceClock;
use crate::engine::EngineShared;
use crate::provisional::{BalanceDelta, FieldPatch, ProvisionalRow, StockDelta};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tillsync_api::{RemoteBatch, RemoteError, RemoteStore, RemoteWrite};
use tillsync_types::error::EngineError;
use tillsync_types::time::now_ms;
use tillsync_types::{
    Assignment, Bundle, BundleKind, BundleStep, Charge, ChargeStatus, Collection, Entity,
    EntityId, EntityRef, Money, OperationMeta, OrganizationSettings, PendingBundle, Player,
    Product, StepAck, StepKind,
};
use tokio::sync::Mutex;

fn step(bundle_id: &str, kind: StepKind) -> BundleStep {
    BundleStep {
        op_id: DeviceClock::step_op_id(bundle_id, &kind.name()),
        kind,
    }
}

fn bundle_of(
    bundle_id: String,
    kind: BundleKind,
    entity_refs: BTreeMap<String, EntityRef>,
    steps: Vec<BundleStep>,
    meta: &OperationMeta,
) -> Bundle {
    Bundle {
        bundle_id,
        kind,
        entity_refs,
        steps,
        vector_clock: meta.vector_clock.clone(),
        timestamp: meta.timestamp,
        source: meta.source,
    }
}

/// A sale: the assignment row, the stock it consumed, and the debt it left.
pub fn assignment_sale_bundle(assignment: &Assignment, meta: &OperationMeta) -> Bundle {
    let bundle_id = DeviceClock::new_id();
    let steps = vec![
        step(
            &bundle_id,
            StepKind::CreateAssignment {
                assignment: assignment.clone(),
            },
        ),
        step(
            &bundle_id,
            StepKind::StockDelta {
                product_id: assignment.product_id.clone(),
                delta: -assignment.quantity,
            },
        ),
        step(
            &bundle_id,
            StepKind::BalanceDelta {
                player_id: assignment.player_id.clone(),
                delta: assignment.total,
                bundle_kind: BundleKind::AssignmentSale,
            },
        ),
    ];
    let refs = BTreeMap::from([
        ("assignment".into(), EntityRef::One(assignment.id.clone())),
        ("product".into(), EntityRef::One(assignment.product_id.clone())),
        ("player".into(), EntityRef::One(assignment.player_id.clone())),
    ]);
    bundle_of(bundle_id, BundleKind::AssignmentSale, refs, steps, meta)
}

pub fn charge_bundle(charge: &Charge, meta: &OperationMeta) -> Bundle {
    let bundle_id = DeviceClock::new_id();
    let steps = vec![
        step(
            &bundle_id,
            StepKind::CreateCharge {
                charge: charge.clone(),
            },
        ),
        step(
            &bundle_id,
            StepKind::BalanceDelta {
                player_id: charge.player_id.clone(),
                delta: charge.amount,
                bundle_kind: BundleKind::Charge,
            },
        ),
    ];
    let refs = BTreeMap::from([
        ("charge".into(), EntityRef::One(charge.id.clone())),
        ("player".into(), EntityRef::One(charge.player_id.clone())),
    ]);
    bundle_of(bundle_id, BundleKind::Charge, refs, steps, meta)
}

/// Settles a set of unpaid assignments: each gets `paid = true`, and one
/// negative balance delta covers the sum.
pub fn player_payment_bundle(
    player_id: &str,
    assignments: &[Assignment],
    meta: &OperationMeta,
) -> Bundle {
    let bundle_id = DeviceClock::new_id();
    let total: Money = assignments.iter().map(|a| a.total).sum();
    let mut steps: Vec<BundleStep> = assignments
        .iter()
        .map(|a| {
            step(
                &bundle_id,
                StepKind::UpdateAssignment {
                    assignment_id: a.id.clone(),
                    updates: json!({"paid": true, "updatedAt": meta.timestamp}),
                },
            )
        })
        .collect();
    steps.push(step(
        &bundle_id,
        StepKind::BalanceDelta {
            player_id: player_id.to_string(),
            delta: -total,
            bundle_kind: BundleKind::PlayerPayment,
        },
    ));
    let refs = BTreeMap::from([
        ("player".into(), EntityRef::One(player_id.to_string())),
        (
            "assignments".into(),
            EntityRef::Many(assignments.iter().map(|a| a.id.clone()).collect()),
        ),
    ]);
    bundle_of(bundle_id, BundleKind::PlayerPayment, refs, steps, meta)
}

/// Flips a charge's status. Settling a pending charge relieves the debt it
/// created; reverting restores it.
pub fn charge_update_bundle(
    charge: &Charge,
    new_status: ChargeStatus,
    meta: &OperationMeta,
) -> Bundle {
    let bundle_id = DeviceClock::new_id();
    let mut steps = vec![step(
        &bundle_id,
        StepKind::UpdateCharge {
            charge_id: charge.id.clone(),
            status: new_status,
        },
    )];
    if new_status != charge.status {
        let delta = match new_status {
            ChargeStatus::Paid => -charge.amount,
            ChargeStatus::Pending => charge.amount,
        };
        steps.push(step(
            &bundle_id,
            StepKind::BalanceDelta {
                player_id: charge.player_id.clone(),
                delta,
                bundle_kind: BundleKind::ChargeUpdate,
            },
        ));
    }
    let refs = BTreeMap::from([
        ("charge".into(), EntityRef::One(charge.id.clone())),
        ("player".into(), EntityRef::One(charge.player_id.clone())),
    ]);
    bundle_of(bundle_id, BundleKind::ChargeUpdate, refs, steps, meta)
}

pub fn charge_delete_bundle(charge: &Charge, meta: &OperationMeta) -> Bundle {
    let bundle_id = DeviceClock::new_id();
    let steps = vec![step(
        &bundle_id,
        StepKind::DeleteCharge {
            charge_id: charge.id.clone(),
        },
    )];
    let refs = BTreeMap::from([("charge".into(), EntityRef::One(charge.id.clone()))]);
    bundle_of(bundle_id, BundleKind::ChargeDelete, refs, steps, meta)
}

pub fn organization_update_bundle(
    org_id: &str,
    updates: serde_json::Value,
    meta: &OperationMeta,
) -> Bundle {
    let bundle_id = DeviceClock::new_id();
    let steps = vec![step(&bundle_id, StepKind::UpdateOrganization { updates })];
    let refs = BTreeMap::from([("organization".into(), EntityRef::One(org_id.to_string()))]);
    bundle_of(bundle_id, BundleKind::OrganizationUpdate, refs, steps, meta)
}

impl EngineShared {
    /// Stages a freshly built bundle: overlays first (so the next read sees
    /// it), then the durable pending-bundle queue.
    pub(crate) async fn stage_bundle(&mut self, bundle: &Bundle) -> Result<(), EngineError> {
        for bundle_step in &bundle.steps {
            let op_id = bundle_step.op_id.clone();
            match &bundle_step.kind {
                StepKind::CreateAssignment { assignment } => {
                    self.provisional
                        .add_assignment(ProvisionalRow {
                            row: assignment.clone(),
                            op_id,
                            timestamp: bundle.timestamp,
                        })
                        .await?;
                }
                StepKind::StockDelta { product_id, delta } => {
                    self.provisional
                        .add_stock_delta(
                            product_id,
                            StockDelta {
                                delta: *delta,
                                op_id,
                                timestamp: bundle.timestamp,
                            },
                        )
                        .await?;
                }
                StepKind::BalanceDelta {
                    player_id,
                    delta,
                    bundle_kind,
                } => {
                    self.provisional
                        .add_balance_delta(
                            player_id,
                            BalanceDelta {
                                delta: *delta,
                                op_id,
                                timestamp: bundle.timestamp,
                                bundle_kind: Some(*bundle_kind),
                            },
                        )
                        .await?;
                }
                StepKind::UpdateAssignment {
                    assignment_id,
                    updates,
                } => {
                    self.provisional
                        .add_assignment_update(
                            assignment_id,
                            FieldPatch {
                                updates: updates.clone(),
                                op_id,
                                timestamp: bundle.timestamp,
                            },
                        )
                        .await?;
                }
                StepKind::CreateCharge { charge } => {
                    self.provisional
                        .add_charge(ProvisionalRow {
                            row: charge.clone(),
                            op_id,
                            timestamp: bundle.timestamp,
                        })
                        .await?;
                }
                // Status flips and deletions become visible at commit; the
                // conditional balance delta above carries their overlay
                // effect.
                StepKind::UpdateCharge { .. } | StepKind::DeleteCharge { .. } => {}
                StepKind::UpdateOrganization { updates } => {
                    self.provisional
                        .add_organization_update(FieldPatch {
                            updates: updates.clone(),
                            op_id,
                            timestamp: bundle.timestamp,
                        })
                        .await?;
                }
            }
        }

        self.outbox
            .push_bundle(PendingBundle {
                bundle: bundle.clone(),
                enqueued_at: now_ms(),
                attempts: 0,
            })
            .await?;
        Ok(())
    }

    /// Folds an acknowledged bundle into the base cache, clears its overlay
    /// entries, and drops it from the pending queue. A bundle whose steps
    /// were partly pre-applied at the remote commits exactly the same way —
    /// the acks list covers every step either way.
    pub(crate) async fn commit_bundle_local(
        &mut self,
        bundle: &Bundle,
        acks: &[StepAck],
    ) -> Result<(), EngineError> {
        let mut seen: HashSet<&str> = HashSet::new();

        for bundle_step in &bundle.steps {
            if !seen.insert(bundle_step.op_id.as_str()) {
                continue;
            }
            match &bundle_step.kind {
                StepKind::CreateAssignment { assignment } => {
                    let mut rows = self.cache.rows::<Assignment>().await?;
                    if !rows.iter().any(|a| a.id() == assignment.id()) {
                        rows.push(assignment.clone());
                        self.cache.save_rows(&rows).await?;
                    }
                }
                StepKind::StockDelta { product_id, delta } => {
                    let mut rows = self.cache.rows::<Product>().await?;
                    if let Some(product) = rows.iter_mut().find(|p| p.id() == product_id) {
                        product.stock += delta;
                        product.updated_at = product.updated_at.max(bundle.timestamp);
                        self.cache.save_rows(&rows).await?;
                    }
                }
                StepKind::BalanceDelta {
                    player_id,
                    delta,
                    bundle_kind,
                } => {
                    let mut rows = self.cache.rows::<Player>().await?;
                    if let Some(player) = rows.iter_mut().find(|p| p.id() == player_id) {
                        player.balance += delta;
                        if *bundle_kind == BundleKind::AssignmentSale && *delta > 0 {
                            player.total_spent += delta;
                            player.total_purchases += 1;
                            player.last_purchase_date = Some(bundle.timestamp);
                        }
                        player.updated_at = player.updated_at.max(bundle.timestamp);
                        self.cache.save_rows(&rows).await?;
                    }
                }
                StepKind::UpdateAssignment {
                    assignment_id,
                    updates,
                } => {
                    let mut rows = self.cache.rows::<Assignment>().await?;
                    if let Some(assignment) =
                        rows.iter_mut().find(|a| a.id() == assignment_id)
                    {
                        assignment.merge_fields(updates)?;
                        assignment.updated_at = assignment.updated_at.max(bundle.timestamp);
                        self.cache.save_rows(&rows).await?;
                    }
                }
                StepKind::CreateCharge { charge } => {
                    let mut rows = self.cache.rows::<Charge>().await?;
                    if !rows.iter().any(|c| c.id() == charge.id()) {
                        rows.push(charge.clone());
                        self.cache.save_rows(&rows).await?;
                    }
                }
                StepKind::UpdateCharge { charge_id, status } => {
                    let mut rows = self.cache.rows::<Charge>().await?;
                    if let Some(charge) = rows.iter_mut().find(|c| c.id() == charge_id) {
                        charge.status = *status;
                        charge.updated_at = charge.updated_at.max(bundle.timestamp);
                        self.cache.save_rows(&rows).await?;
                    }
                }
                StepKind::DeleteCharge { charge_id } => {
                    let mut rows = self.cache.rows::<Charge>().await?;
                    let before = rows.len();
                    rows.retain(|c| c.id() != charge_id);
                    if rows.len() != before {
                        self.cache.save_rows(&rows).await?;
                    }
                }
                StepKind::UpdateOrganization { updates } => {
                    let org_id = self.org_id()?.to_string();
                    let mut rows = self.cache.rows::<OrganizationSettings>().await?;
                    if let Some(settings) = rows.iter_mut().find(|o| o.id() == &org_id) {
                        settings.merge_fields(updates)?;
                        settings.updated_at = settings.updated_at.max(bundle.timestamp);
                    } else {
                        let mut settings = OrganizationSettings {
                            id: org_id.clone(),
                            organization_id: org_id,
                            created_at: bundle.timestamp,
                            updated_at: bundle.timestamp,
                            ..Default::default()
                        };
                        settings.merge_fields(updates)?;
                        rows.push(settings);
                    }
                    self.cache.save_rows(&rows).await?;
                }
            }
        }

        let committed: HashSet<String> = acks.iter().map(|a| a.op_id.clone()).collect();
        self.provisional.remove_ops(&committed).await?;
        self.outbox.remove_bundle(&bundle.bundle_id).await?;

        tracing::info!(
            target: "bundle",
            bundle_id = %bundle.bundle_id,
            kind = ?bundle.kind,
            steps = bundle.steps.len(),
            skipped = acks.iter().filter(|a| a.skipped).count(),
            "bundle committed"
        );
        Ok(())
    }
}

/// Applies a bundle at the remote as one atomic transaction.
///
/// Steps already present in the applied-ops ledger are skipped and
/// acknowledged as such; the rest become a single batch that also records
/// their op ids, so a crash between commit and local cleanup leaves the
/// retry harmless.
pub(crate) async fn apply_bundle_remote(
    shared: &Arc<Mutex<EngineShared>>,
    bundle: &Bundle,
) -> Result<Vec<StepAck>, RemoteError> {
    let (org_id, remote, dependency_rows) = {
        let guard = shared.lock().await;
        let org_id = guard
            .org_id()
            .map_err(|e| RemoteError::Invalid(e.to_string()))?
            .to_string();
        let mut rows: HashMap<EntityId, serde_json::Value> = HashMap::new();
        for bundle_step in &bundle.steps {
            match &bundle_step.kind {
                StepKind::StockDelta { product_id, .. } => {
                    if let Ok(Some(product)) = guard.cache.find::<Product>(product_id).await {
                        if let Ok(value) = serde_json::to_value(&product) {
                            rows.insert(product_id.clone(), value);
                        }
                    }
                }
                StepKind::BalanceDelta { player_id, .. } => {
                    if let Ok(Some(player)) = guard.cache.find::<Player>(player_id).await {
                        if let Ok(value) = serde_json::to_value(&player) {
                            rows.insert(player_id.clone(), value);
                        }
                    }
                }
                _ => {}
            }
        }
        (org_id, guard.remote.clone(), rows)
    };

    let applied = remote.applied_ops(&org_id, &bundle.step_op_ids()).await?;

    let mut batch = RemoteBatch::default();
    let mut acks = Vec::with_capacity(bundle.steps.len());

    for bundle_step in &bundle.steps {
        if applied.contains(&bundle_step.op_id) {
            acks.push(StepAck {
                op_id: bundle_step.op_id.clone(),
                skipped: true,
            });
            continue;
        }

        match &bundle_step.kind {
            StepKind::CreateAssignment { assignment } => {
                batch.push(RemoteWrite::Set {
                    collection: Collection::Assignments,
                    id: assignment.id.clone(),
                    data: serde_json::to_value(assignment)
                        .map_err(|e| RemoteError::Invalid(e.to_string()))?,
                });
            }
            StepKind::StockDelta { product_id, delta } => {
                upsert_dependency(
                    &remote,
                    &org_id,
                    Collection::Products,
                    product_id,
                    &dependency_rows,
                    &mut batch,
                )
                .await?;
                batch.push(RemoteWrite::Increment {
                    collection: Collection::Products,
                    id: product_id.clone(),
                    field: "stock".into(),
                    delta: *delta,
                });
                batch.push(RemoteWrite::AppendDelta {
                    collection: Collection::Products,
                    parent_id: product_id.clone(),
                    subcollection: "stockDeltas".into(),
                    id: bundle_step.op_id.clone(),
                    data: json!({
                        "delta": delta,
                        "opId": bundle_step.op_id,
                        "timestamp": bundle.timestamp,
                        "bundleId": bundle.bundle_id,
                    }),
                });
            }
            StepKind::BalanceDelta {
                player_id,
                delta,
                bundle_kind,
            } => {
                upsert_dependency(
                    &remote,
                    &org_id,
                    Collection::Players,
                    player_id,
                    &dependency_rows,
                    &mut batch,
                )
                .await?;
                batch.push(RemoteWrite::Increment {
                    collection: Collection::Players,
                    id: player_id.clone(),
                    field: "balance".into(),
                    delta: *delta,
                });
                if *bundle_kind == BundleKind::AssignmentSale && *delta > 0 {
                    batch.push(RemoteWrite::Increment {
                        collection: Collection::Players,
                        id: player_id.clone(),
                        field: "totalSpent".into(),
                        delta: *delta,
                    });
                    batch.push(RemoteWrite::Increment {
                        collection: Collection::Players,
                        id: player_id.clone(),
                        field: "totalPurchases".into(),
                        delta: 1,
                    });
                }
                batch.push(RemoteWrite::AppendDelta {
                    collection: Collection::Players,
                    parent_id: player_id.clone(),
                    subcollection: "balanceDeltas".into(),
                    id: bundle_step.op_id.clone(),
                    data: json!({
                        "delta": delta,
                        "opId": bundle_step.op_id,
                        "timestamp": bundle.timestamp,
                        "bundleId": bundle.bundle_id,
                        "bundleKind": bundle_kind,
                    }),
                });
            }
            StepKind::UpdateAssignment {
                assignment_id,
                updates,
            } => {
                batch.push(RemoteWrite::Merge {
                    collection: Collection::Assignments,
                    id: assignment_id.clone(),
                    data: updates.clone(),
                });
            }
            StepKind::CreateCharge { charge } => {
                batch.push(RemoteWrite::Set {
                    collection: Collection::Charges,
                    id: charge.id.clone(),
                    data: serde_json::to_value(charge)
                        .map_err(|e| RemoteError::Invalid(e.to_string()))?,
                });
            }
            StepKind::UpdateCharge { charge_id, status } => {
                batch.push(RemoteWrite::Merge {
                    collection: Collection::Charges,
                    id: charge_id.clone(),
                    data: json!({"status": status, "updatedAt": bundle.timestamp}),
                });
            }
            StepKind::DeleteCharge { charge_id } => {
                batch.push(RemoteWrite::Delete {
                    collection: Collection::Charges,
                    id: charge_id.clone(),
                });
            }
            StepKind::UpdateOrganization { updates } => {
                batch.push(RemoteWrite::Merge {
                    collection: Collection::Organizations,
                    id: org_id.clone(),
                    data: updates.clone(),
                });
            }
        }

        batch.push(RemoteWrite::MarkApplied {
            op_id: bundle_step.op_id.clone(),
        });
        acks.push(StepAck {
            op_id: bundle_step.op_id.clone(),
            skipped: false,
        });
    }

    if !batch.is_empty() {
        remote.commit(&org_id, batch).await?;
    }
    Ok(acks)
}

/// The remote may not have seen an entity this device created offline; a
/// delta against a missing document would be lost. Upsert the full cached
/// row first.
async fn upsert_dependency(
    remote: &Arc<dyn RemoteStore>,
    org_id: &str,
    collection: Collection,
    id: &str,
    dependency_rows: &HashMap<EntityId, serde_json::Value>,
    batch: &mut RemoteBatch,
) -> Result<(), RemoteError> {
    if remote.exists(org_id, collection, id).await? {
        return Ok(());
    }
    if let Some(row) = dependency_rows.get(id) {
        batch.push(RemoteWrite::Set {
            collection,
            id: id.to_string(),
            data: row.clone(),
        });
    }
    Ok(())
}

/// Attempts every pending bundle in FIFO order. Network-class failures stop
/// the pass (the link is down for all of them); real failures skip to the
/// next bundle after bumping the attempt counter.
pub(crate) async fn flush_pending_bundles(
    shared: &Arc<Mutex<EngineShared>>,
) -> Result<usize, EngineError> {
    let bundles: Vec<Bundle> = {
        let guard = shared.lock().await;
        guard
            .outbox
            .pending_bundles()
            .iter()
            .map(|b| b.bundle.clone())
            .collect()
    };

    let mut applied = 0;
    for bundle in bundles {
        match apply_bundle_remote(shared, &bundle).await {
            Ok(acks) => {
                let mut guard = shared.lock().await;
                guard.commit_bundle_local(&bundle, &acks).await?;
                applied += 1;
            }
            Err(error) => {
                let mut guard = shared.lock().await;
                let online = guard.network.is_online();
                match error.class() {
                    tillsync_api::FailureClass::Network => {
                        tracing::debug!(
                            target: "bundle",
                            bundle_id = %bundle.bundle_id,
                            error = %error,
                            "bundle deferred on network failure"
                        );
                        break;
                    }
                    tillsync_api::FailureClass::Real => {
                        if online {
                            guard.outbox.bump_bundle_attempts(&bundle.bundle_id).await?;
                        }
                        tracing::warn!(
                            target: "bundle",
                            bundle_id = %bundle.bundle_id,
                            error = %error,
                            "bundle application failed"
                        );
                    }
                }
            }
        }
    }
    Ok(applied)
}
