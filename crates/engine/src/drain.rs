//! The outbox drain: pending bundles first, then queued operations in FIFO
//! batches, with retry classification on every failure.

use crate::bundle::flush_pending_bundles;
use crate::engine::EngineShared;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tillsync_api::{RemoteBatch, RemoteError, RemoteWrite};
use tillsync_types::error::EngineError;
use tillsync_types::time::now_ms;
use tillsync_types::{Collection, Money, OpId, OperationKind, Player, Product, SyncQueueItem};
use tokio::sync::Mutex;

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed {
        bundles_applied: usize,
        items_processed: usize,
        items_failed: usize,
    },
    /// The device is offline; nothing was attempted.
    Offline,
    /// Another drain holds the sync lock.
    AlreadySyncing,
}

/// Payload of a free-standing balance adjustment.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BalanceAdjustData {
    pub player_id: String,
    pub delta: Money,
}

/// Runs one full drain pass, guarded by the `is_syncing` lock.
pub(crate) async fn run_drain(shared: &Arc<Mutex<EngineShared>>) -> Result<DrainOutcome, EngineError> {
    let config = {
        let mut guard = shared.lock().await;
        if guard.is_syncing {
            return Ok(DrainOutcome::AlreadySyncing);
        }
        if !guard.network.is_online() {
            return Ok(DrainOutcome::Offline);
        }
        guard.is_syncing = true;
        guard.sync_started_at = Some(now_ms());
        guard.config.clone()
    };

    let result = drain_locked(shared, &config).await;

    {
        let mut guard = shared.lock().await;
        guard.is_syncing = false;
        guard.sync_started_at = None;
    }

    result
}

async fn drain_locked(
    shared: &Arc<Mutex<EngineShared>>,
    config: &crate::config::EngineConfig,
) -> Result<DrainOutcome, EngineError> {
    // Bundles carry the multi-entity intents; they go first so their
    // provisional state commits before any related single operations.
    let bundles_applied = flush_pending_bundles(shared).await?;

    let due = {
        let guard = shared.lock().await;
        guard.outbox.due_items(now_ms())
    };

    let mut items_processed = 0usize;
    let mut items_failed = 0usize;

    for batch in due.chunks(config.batch_size.max(1)) {
        let mut batch_marks: Vec<OpId> = Vec::new();

        for item in batch {
            match sync_single_item(shared, item).await {
                Ok(()) => {
                    if let Err(store_error) = finalize_success(shared, item).await {
                        // Local persistence failed mid-batch: roll back the
                        // processed marks for this batch and surface.
                        let mut guard = shared.lock().await;
                        guard.outbox.unmark_processed(&batch_marks).await?;
                        return Err(store_error);
                    }
                    batch_marks.push(item.id.clone());
                    items_processed += 1;
                }
                Err(error) => {
                    // A missing document on delete means the remote is
                    // already where we wanted it.
                    if item.action == OperationKind::Delete
                        && matches!(error, RemoteError::NotFound(_))
                    {
                        finalize_success(shared, item).await?;
                        batch_marks.push(item.id.clone());
                        items_processed += 1;
                        continue;
                    }

                    items_failed += 1;
                    let mut guard = shared.lock().await;
                    let online = guard.network.is_online();
                    guard
                        .outbox
                        .record_failure(
                            &item.id,
                            error.class(),
                            &error.to_string(),
                            online,
                            config,
                            now_ms(),
                        )
                        .await?;
                }
            }
        }

        if !config.batch_gap.is_zero() {
            tokio::time::sleep(config.batch_gap).await;
        }
    }

    Ok(DrainOutcome::Completed {
        bundles_applied,
        items_processed,
        items_failed,
    })
}

/// Pushes one outbox item to the remote as an atomic batch, guarded by the
/// applied-ops ledger.
async fn sync_single_item(
    shared: &Arc<Mutex<EngineShared>>,
    item: &SyncQueueItem,
) -> Result<(), RemoteError> {
    // Charges and organizations only travel inside bundles; the public API
    // rejects single operations on them, so anything here is a stale relic.
    if matches!(
        item.collection,
        Collection::Charges | Collection::Organizations
    ) {
        tracing::warn!(
            target: "drain",
            id = %item.id,
            collection = %item.collection,
            "skipping bundle-only collection item"
        );
        return Ok(());
    }

    let (org_id, remote) = {
        let guard = shared.lock().await;
        let org_id = guard
            .org_id()
            .map_err(|e| RemoteError::Invalid(e.to_string()))?
            .to_string();
        (org_id, guard.remote.clone())
    };

    let already = remote.applied_ops(&org_id, &[item.id.clone()]).await?;
    if already.contains(&item.id) {
        return Ok(());
    }

    let entity_id = item
        .entity_id
        .clone()
        .or_else(|| {
            item.data
                .get("id")
                .and_then(|v| v.as_str())
                .map(String::from)
        })
        .ok_or_else(|| RemoteError::Invalid(format!("item {} has no entity id", item.id)))?;

    let mut batch = RemoteBatch::default();
    match item.action {
        OperationKind::Create => {
            // A bundle that depended on this entity may have upserted it
            // (and incremented its materialised fields) already; replaying
            // the original payload would roll those forward writes back.
            if !remote.exists(&org_id, item.collection, &entity_id).await? {
                batch.push(RemoteWrite::Set {
                    collection: item.collection,
                    id: entity_id,
                    data: item.data.clone(),
                });
            }
        }
        OperationKind::Update => {
            if remote.exists(&org_id, item.collection, &entity_id).await? {
                batch.push(RemoteWrite::Merge {
                    collection: item.collection,
                    id: entity_id,
                    data: item.data.clone(),
                });
            } else {
                // The remote never saw this entity; send the full cached
                // row so the update lands as an upsert.
                let full_row = {
                    let guard = shared.lock().await;
                    guard.full_row_json(item.collection, &entity_id).await
                };
                let data = full_row.unwrap_or_else(|| item.data.clone());
                batch.push(RemoteWrite::Set {
                    collection: item.collection,
                    id: entity_id,
                    data,
                });
            }
        }
        OperationKind::Delete => {
            batch.push(RemoteWrite::Delete {
                collection: item.collection,
                id: entity_id,
            });
        }
        OperationKind::UpdateBalance => {
            let data: BalanceAdjustData = serde_json::from_value(item.data.clone())
                .map_err(|e| RemoteError::Invalid(format!("balance payload: {e}")))?;
            if !remote
                .exists(&org_id, Collection::Players, &data.player_id)
                .await?
            {
                let full_row = {
                    let guard = shared.lock().await;
                    guard.full_row_json(Collection::Players, &data.player_id).await
                };
                if let Some(row) = full_row {
                    batch.push(RemoteWrite::Set {
                        collection: Collection::Players,
                        id: data.player_id.clone(),
                        data: row,
                    });
                }
            }
            batch.push(RemoteWrite::Increment {
                collection: Collection::Players,
                id: data.player_id.clone(),
                field: "balance".into(),
                delta: data.delta,
            });
            batch.push(RemoteWrite::AppendDelta {
                collection: Collection::Players,
                parent_id: data.player_id,
                subcollection: "balanceDeltas".into(),
                id: item.id.clone(),
                data: json!({
                    "delta": data.delta,
                    "opId": item.id,
                    "timestamp": item.timestamp,
                }),
            });
        }
        OperationKind::CreateAssignmentTransaction => {
            let data: crate::applier::AssignmentTransactionData =
                serde_json::from_value(item.data.clone())
                    .map_err(|e| RemoteError::Invalid(format!("transaction payload: {e}")))?;
            batch.push(RemoteWrite::Set {
                collection: Collection::Assignments,
                id: data.assignment.id.clone(),
                data: serde_json::to_value(&data.assignment)
                    .map_err(|e| RemoteError::Invalid(e.to_string()))?,
            });
            batch.push(RemoteWrite::Increment {
                collection: Collection::Products,
                id: data.assignment.product_id.clone(),
                field: "stock".into(),
                delta: data.stock_delta,
            });
            batch.push(RemoteWrite::Increment {
                collection: Collection::Players,
                id: data.assignment.player_id.clone(),
                field: "totalSpent".into(),
                delta: data.total_spent_delta,
            });
            batch.push(RemoteWrite::Increment {
                collection: Collection::Players,
                id: data.assignment.player_id.clone(),
                field: "totalPurchases".into(),
                delta: data.purchase_count_delta,
            });
            batch.push(RemoteWrite::AppendDelta {
                collection: Collection::Products,
                parent_id: data.assignment.product_id.clone(),
                subcollection: "stockDeltas".into(),
                id: item.id.clone(),
                data: json!({
                    "delta": data.stock_delta,
                    "opId": item.id,
                    "timestamp": item.timestamp,
                }),
            });
        }
    }

    batch.push(RemoteWrite::MarkApplied {
        op_id: item.id.clone(),
    });
    remote.commit(&org_id, batch).await
}

/// Post-success bookkeeping: the item leaves the queue, and balance
/// adjustments finally land in the base cache now that the remote holds
/// them.
async fn finalize_success(
    shared: &Arc<Mutex<EngineShared>>,
    item: &SyncQueueItem,
) -> Result<(), EngineError> {
    let mut guard = shared.lock().await;
    guard.outbox.complete(&item.id).await?;

    if item.action == OperationKind::UpdateBalance {
        if let Ok(data) = serde_json::from_value::<BalanceAdjustData>(item.data.clone()) {
            let mut rows = guard.cache.rows::<Player>().await?;
            if let Some(player) = rows.iter_mut().find(|p| p.id == data.player_id) {
                player.balance += data.delta;
                player.updated_at = player.updated_at.max(now_ms());
                guard.cache.save_rows(&rows).await?;
            }
            let committed: std::collections::HashSet<OpId> =
                std::iter::once(item.id.clone()).collect();
            guard.provisional.remove_ops(&committed).await?;
        }
    }
    Ok(())
}

impl EngineShared {
    /// Full cached row for an entity, serialised for a remote upsert.
    pub(crate) async fn full_row_json(
        &self,
        collection: Collection,
        id: &str,
    ) -> Option<serde_json::Value> {
        let value = match collection {
            Collection::Products => serde_json::to_value(self.cache.find::<Product>(id).await.ok()??),
            Collection::Players => serde_json::to_value(self.cache.find::<Player>(id).await.ok()??),
            Collection::Assignments => serde_json::to_value(
                self.cache
                    .find::<tillsync_types::Assignment>(id)
                    .await
                    .ok()??,
            ),
            Collection::StaffUsers => serde_json::to_value(
                self.cache.find::<tillsync_types::StaffUser>(id).await.ok()??,
            ),
            Collection::Reports => {
                serde_json::to_value(self.cache.find::<tillsync_types::Report>(id).await.ok()??)
            }
            Collection::Charges => {
                serde_json::to_value(self.cache.find::<tillsync_types::Charge>(id).await.ok()??)
            }
            Collection::Organizations => serde_json::to_value(
                self.cache
                    .find::<tillsync_types::OrganizationSettings>(id)
                    .await
                    .ok()??,
            ),
        };
        value.ok()
    }
}
