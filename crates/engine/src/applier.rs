//! The single write path. Every mutation — local API call, hydrated server
//! row, replayed outbox item — lands in `apply_op`, which keeps the cache
//! and the outbox mutually coherent.

use crate::engine::EngineShared;
use crate::resolver::Resolution;
use serde::Deserialize;
use tillsync_types::error::EngineError;
use tillsync_types::time::{clamp_timestamp, now_ms};
use tillsync_types::{
    Assignment, Charge, Collection, Entity, Money, Operation, OperationKind, OrganizationSettings,
    Player, Product, Report, Source, StaffUser, SyncQueueItem, VersionMeta,
};

/// What `apply_op` did with the operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpOutcome {
    /// The cache accepted a change (create applied, update accepted or
    /// merged, delete removed a row).
    pub cache_changed: bool,
    /// The operation was queued for the remote.
    pub enqueued: bool,
}

/// Payload of a compound `CreateAssignmentTransaction` operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentTransactionData {
    pub assignment: Assignment,
    pub stock_delta: i64,
    pub total_spent_delta: Money,
    pub purchase_count_delta: i64,
}

impl EngineShared {
    /// Applies an operation to the local cache and, for non-server sources,
    /// enqueues it for the remote.
    ///
    /// Returning `Ok` means the change is locally durable. It says nothing
    /// about remote persistence — that is the outbox's job.
    pub(crate) async fn apply_op(&mut self, mut op: Operation) -> Result<OpOutcome, EngineError> {
        let now = now_ms();
        op.metadata.timestamp = clamp_timestamp(op.metadata.timestamp, now);

        // Server rows carry peer clocks; fold them in so later local ops
        // causally follow everything this device has seen.
        if op.metadata.source == Source::Server {
            self.clock.observe(&op.metadata.vector_clock).await?;
        }

        let cache_changed = self.apply_to_cache(&op).await?;

        let mut enqueued = false;
        if op.metadata.source != Source::Server {
            enqueued = self.outbox.enqueue(queue_item(&op, now)).await?;
        }

        tracing::debug!(
            target: "applier",
            op_id = %op.id,
            kind = op.kind.as_str(),
            collection = %op.collection,
            cache_changed,
            enqueued,
            "operation applied"
        );

        Ok(OpOutcome {
            cache_changed,
            enqueued,
        })
    }

    async fn apply_to_cache(&mut self, op: &Operation) -> Result<bool, EngineError> {
        match (op.collection, op.kind) {
            (_, OperationKind::Create) => self.create_dispatch(op).await,
            (Collection::Products, OperationKind::Update) => {
                self.update_row::<Product>(op, |resolver, current, patch, meta| {
                    resolver.resolve_product(current, patch, meta)
                })
                .await
            }
            (Collection::Players, OperationKind::Update) => {
                self.update_row::<Player>(op, |resolver, current, patch, meta| {
                    resolver.resolve_player(current, patch, meta)
                })
                .await
            }
            (Collection::StaffUsers, OperationKind::Update) => {
                self.update_row::<StaffUser>(op, |r, c, _, m| r.resolve(c, m)).await
            }
            (Collection::Assignments, OperationKind::Update) => {
                self.update_row::<Assignment>(op, |r, c, _, m| r.resolve(c, m)).await
            }
            (Collection::Reports, OperationKind::Update) => {
                self.update_row::<Report>(op, |r, c, _, m| r.resolve(c, m)).await
            }
            (Collection::Charges, OperationKind::Update) => {
                self.update_row::<Charge>(op, |r, c, _, m| r.resolve(c, m)).await
            }
            (Collection::Organizations, OperationKind::Update) => {
                self.update_row::<OrganizationSettings>(op, |r, c, _, m| r.resolve(c, m))
                    .await
            }
            (_, OperationKind::Delete) => self.delete_dispatch(op).await,
            // Deliberate no-op: balance is read through the provisional
            // overlay before commit and mutated by the bundle committer
            // after, never directly here. Applying it a third time would
            // double-count.
            (Collection::Players, OperationKind::UpdateBalance) => Ok(false),
            (Collection::Assignments, OperationKind::CreateAssignmentTransaction) => {
                self.apply_assignment_transaction(op).await
            }
            (collection, kind) => Err(EngineError::Validation(format!(
                "operation kind {} is not valid for collection {}",
                kind.as_str(),
                collection
            ))),
        }
    }

    async fn create_dispatch(&mut self, op: &Operation) -> Result<bool, EngineError> {
        match op.collection {
            Collection::Products => self.create_row::<Product>(op).await,
            Collection::Players => self.create_row::<Player>(op).await,
            Collection::StaffUsers => self.create_row::<StaffUser>(op).await,
            Collection::Assignments => self.create_row::<Assignment>(op).await,
            Collection::Reports => self.create_row::<Report>(op).await,
            Collection::Charges => self.create_row::<Charge>(op).await,
            Collection::Organizations => self.create_row::<OrganizationSettings>(op).await,
        }
    }

    async fn delete_dispatch(&mut self, op: &Operation) -> Result<bool, EngineError> {
        match op.collection {
            Collection::Products => self.delete_row::<Product>(op).await,
            Collection::Players => self.delete_row::<Player>(op).await,
            Collection::StaffUsers => self.delete_row::<StaffUser>(op).await,
            Collection::Assignments => self.delete_row::<Assignment>(op).await,
            Collection::Reports => self.delete_row::<Report>(op).await,
            Collection::Charges => self.delete_row::<Charge>(op).await,
            Collection::Organizations => self.delete_row::<OrganizationSettings>(op).await,
        }
    }

    /// Idempotent append: a row with the same id is left untouched.
    async fn create_row<T: Entity>(&mut self, op: &Operation) -> Result<bool, EngineError> {
        let mut entity: T = serde_json::from_value(op.data.clone())?;

        if op.metadata.source == Source::Local {
            entity.set_updated_at(op.metadata.timestamp);
            *entity.version_mut() = VersionMeta {
                device_id: op.metadata.device_id.clone(),
                counter: op.metadata.version,
                timestamp: op.metadata.timestamp,
                vector_clock: op.metadata.vector_clock.clone(),
            };
        }

        let mut rows = self.cache.rows::<T>().await?;
        if rows.iter().any(|r| r.id() == entity.id()) {
            return Ok(false);
        }
        rows.push(entity);
        self.cache.save_rows(&rows).await?;
        Ok(true)
    }

    async fn update_row<T: Entity>(
        &mut self,
        op: &Operation,
        resolve: impl FnOnce(
            &crate::resolver::Resolver,
            &T,
            &serde_json::Value,
            &tillsync_types::OperationMeta,
        ) -> Resolution<T>,
    ) -> Result<bool, EngineError> {
        let id = op.entity_id.as_deref().ok_or(EngineError::MissingEntityId)?;

        let mut rows = self.cache.rows::<T>().await?;
        let Some(index) = rows.iter().position(|r| r.id() == id) else {
            // Updates for rows this device has never seen are dropped; the
            // hydrator turns unseen server rows into creates instead.
            tracing::debug!(target: "applier", id, collection = %op.collection, "update for unknown row dropped");
            return Ok(false);
        };

        let resolver = self.resolver();
        let Some(current) = rows.get(index) else {
            return Ok(false);
        };

        match resolve(&resolver, current, &op.data, &op.metadata) {
            Resolution::Accept => {
                let Some(row) = rows.get_mut(index) else {
                    return Ok(false);
                };
                row.merge_fields(&op.data)?;
                row.set_updated_at(op.metadata.timestamp);
                let version = row.version_mut();
                version.device_id = op.metadata.device_id.clone();
                version.counter = op.metadata.version;
                version.timestamp = op.metadata.timestamp;
                version.vector_clock.merge(&op.metadata.vector_clock);
            }
            Resolution::Merge(merged) => {
                if let Some(row) = rows.get_mut(index) {
                    *row = merged;
                }
            }
            Resolution::Reject(reason) => {
                tracing::debug!(target: "applier", id, collection = %op.collection, reason, "update rejected");
                return Ok(false);
            }
        }

        self.cache.save_rows(&rows).await?;
        Ok(true)
    }

    /// Idempotent removal: deleting an absent row is a no-op.
    async fn delete_row<T: Entity>(&mut self, op: &Operation) -> Result<bool, EngineError> {
        let id = op.entity_id.as_deref().ok_or(EngineError::MissingEntityId)?;
        let mut rows = self.cache.rows::<T>().await?;
        let before = rows.len();
        rows.retain(|r| r.id() != id);
        if rows.len() == before {
            return Ok(false);
        }
        self.cache.save_rows(&rows).await?;
        Ok(true)
    }

    /// Compound sale write: assignment row, product stock, player totals.
    /// All three collection writes succeed together or the operation
    /// errors before any outbox entry is made.
    ///
    /// Balance is intentionally absent: it travels as a separate bundle
    /// step.
    async fn apply_assignment_transaction(&mut self, op: &Operation) -> Result<bool, EngineError> {
        let data: AssignmentTransactionData = serde_json::from_value(op.data.clone())?;

        let mut assignments = self.cache.rows::<Assignment>().await?;
        let mut products = self.cache.rows::<Product>().await?;
        let mut players = self.cache.rows::<Player>().await?;

        let created = if assignments.iter().any(|a| a.id() == data.assignment.id()) {
            false
        } else {
            assignments.push(data.assignment.clone());
            true
        };

        if let Some(product) = products
            .iter_mut()
            .find(|p| p.id() == &data.assignment.product_id)
        {
            product.stock += data.stock_delta;
            product.set_updated_at(op.metadata.timestamp);
        }

        if let Some(player) = players
            .iter_mut()
            .find(|p| p.id() == &data.assignment.player_id)
        {
            player.total_spent += data.total_spent_delta;
            player.total_purchases += data.purchase_count_delta;
            player.last_purchase_date = Some(data.assignment.date);
            player.set_updated_at(op.metadata.timestamp);
        }

        self.cache.save_rows(&assignments).await?;
        self.cache.save_rows(&products).await?;
        self.cache.save_rows(&players).await?;
        Ok(created)
    }
}

fn queue_item(op: &Operation, now: i64) -> SyncQueueItem {
    SyncQueueItem {
        id: op.id.clone(),
        action: op.kind,
        collection: op.collection,
        entity_id: op.entity_id.clone(),
        data: op.data.clone(),
        timestamp: now,
        next_attempt_at: now,
        retry_count: 0,
        network_retry_count: 0,
        batch_id: None,
        batch_label: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::clock::DeviceClock;
    use crate::config::EngineConfig;
    use crate::engine::{EngineShared, OrgContext};
    use crate::outbox::Outbox;
    use crate::provisional::ProvisionalStore;
    use serde_json::json;
    use std::sync::Arc;
    use tillsync_api::KvStore;
    use tillsync_test_utils::{ManualNetwork, MemoryKv, MockRemote};
    use tillsync_types::time::now_ms;
    use tillsync_types::{OperationMeta, VectorClock};

    async fn shared() -> EngineShared {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        EngineShared {
            config: EngineConfig::manual(),
            context: Some(OrgContext {
                org_id: "org".into(),
                user_key: "user".into(),
            }),
            kv: kv.clone(),
            remote: Arc::new(MockRemote::new()),
            network: Arc::new(ManualNetwork::new(false)),
            clock: DeviceClock::load(kv.clone()).await.unwrap(),
            cache: LocalCache::new(kv.clone()),
            provisional: ProvisionalStore::load(kv.clone()).await.unwrap(),
            outbox: Outbox::load(kv).await.unwrap(),
            force_server: false,
            is_syncing: false,
            sync_started_at: None,
            last_full_hydration: 0,
        }
    }

    fn product_json(id: &str, stock: i64) -> serde_json::Value {
        json!({
            "id": id,
            "organizationId": "org",
            "name": "Water",
            "price": 200,
            "stock": stock,
            "createdAt": 1,
            "updatedAt": 1
        })
    }

    async fn local_op(
        shared: &mut EngineShared,
        kind: OperationKind,
        collection: Collection,
        entity_id: &str,
        data: serde_json::Value,
    ) -> Operation {
        Operation {
            id: DeviceClock::new_id(),
            kind,
            collection,
            entity_id: Some(entity_id.to_string()),
            data,
            metadata: shared.clock.next_meta(Source::Local).await.unwrap(),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_and_enqueues() {
        let mut shared = shared().await;
        let op = local_op(
            &mut shared,
            OperationKind::Create,
            Collection::Products,
            "p1",
            product_json("p1", 10),
        )
        .await;
        let outcome = shared.apply_op(op.clone()).await.unwrap();
        assert!(outcome.cache_changed);
        assert!(outcome.enqueued);

        // Same operation again: no second row, no second queue entry.
        let outcome = shared.apply_op(op).await.unwrap();
        assert!(!outcome.cache_changed);
        assert!(!outcome.enqueued);
        assert_eq!(shared.cache.rows::<Product>().await.unwrap().len(), 1);
        assert_eq!(shared.outbox.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_server_ops_pass_resolver_and_skip_queue() {
        let mut shared = shared().await;
        let create = local_op(
            &mut shared,
            OperationKind::Create,
            Collection::Products,
            "p1",
            product_json("p1", 10),
        )
        .await;
        shared.apply_op(create).await.unwrap();
        let queue_before = shared.outbox.queue_len();

        // A server row older than the local edit is rejected, and server
        // ops never enqueue.
        let stale = Operation {
            id: DeviceClock::new_id(),
            kind: OperationKind::Update,
            collection: Collection::Products,
            entity_id: Some("p1".into()),
            data: json!({"name": "Stale name"}),
            metadata: OperationMeta {
                device_id: "server".into(),
                // Older than the local row but inside the plausible clock
                // window, so it survives normalisation un-clamped.
                timestamp: now_ms() - 60_000,
                version: 0,
                vector_clock: VectorClock::new(),
                source: Source::Server,
            },
        };
        let outcome = shared.apply_op(stale).await.unwrap();
        assert!(!outcome.cache_changed);
        assert!(!outcome.enqueued);
        assert_eq!(shared.outbox.queue_len(), queue_before);
        let rows = shared.cache.rows::<Product>().await.unwrap();
        assert_eq!(rows[0].name, "Water");
    }

    #[tokio::test]
    async fn test_update_balance_has_no_cache_effect() {
        let mut shared = shared().await;
        let player = json!({
            "id": "q1",
            "organizationId": "org",
            "firstName": "A",
            "lastName": "B",
            "name": "A B",
            "balance": 0,
            "createdAt": 1,
            "updatedAt": 1
        });
        let create = local_op(
            &mut shared,
            OperationKind::Create,
            Collection::Players,
            "q1",
            player,
        )
        .await;
        shared.apply_op(create).await.unwrap();

        let adjust = local_op(
            &mut shared,
            OperationKind::UpdateBalance,
            Collection::Players,
            "q1",
            json!({"playerId": "q1", "delta": 500}),
        )
        .await;
        let outcome = shared.apply_op(adjust).await.unwrap();

        // Queued for the remote, but the base row must not move: the
        // provisional overlay owns pre-commit visibility.
        assert!(outcome.enqueued);
        assert!(!outcome.cache_changed);
        let rows = shared.cache.rows::<Player>().await.unwrap();
        assert_eq!(rows[0].balance, 0);
    }

    #[tokio::test]
    async fn test_assignment_transaction_is_compound() {
        let mut shared = shared().await;
        let create_product = local_op(
            &mut shared,
            OperationKind::Create,
            Collection::Products,
            "p1",
            product_json("p1", 10),
        )
        .await;
        shared.apply_op(create_product).await.unwrap();
        let create_player = local_op(
            &mut shared,
            OperationKind::Create,
            Collection::Players,
            "q1",
            json!({
                "id": "q1",
                "organizationId": "org",
                "firstName": "A",
                "lastName": "B",
                "name": "A B",
                "balance": 0,
                "createdAt": 1,
                "updatedAt": 1
            }),
        )
        .await;
        shared.apply_op(create_player).await.unwrap();

        let date = now_ms();
        let tx = local_op(
            &mut shared,
            OperationKind::CreateAssignmentTransaction,
            Collection::Assignments,
            "a1",
            json!({
                "assignment": {
                    "id": "a1",
                    "organizationId": "org",
                    "playerId": "q1",
                    "productId": "p1",
                    "userName": "A B",
                    "productName": "Water",
                    "quantity": 3,
                    "unitPrice": 200,
                    "total": 600,
                    "date": date,
                    "createdAt": date,
                    "updatedAt": date
                },
                "stockDelta": -3,
                "totalSpentDelta": 600,
                "purchaseCountDelta": 1
            }),
        )
        .await;
        shared.apply_op(tx).await.unwrap();

        // Assignment, stock, and totals all moved together; balance did
        // not — that is a separate bundle step.
        assert_eq!(shared.cache.rows::<Assignment>().await.unwrap().len(), 1);
        let products = shared.cache.rows::<Product>().await.unwrap();
        assert_eq!(products[0].stock, 7);
        let players = shared.cache.rows::<Player>().await.unwrap();
        assert_eq!(players[0].total_spent, 600);
        assert_eq!(players[0].total_purchases, 1);
        assert_eq!(players[0].balance, 0);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let mut shared = shared().await;
        let create = local_op(
            &mut shared,
            OperationKind::Create,
            Collection::Products,
            "p1",
            product_json("p1", 10),
        )
        .await;
        shared.apply_op(create).await.unwrap();

        let delete = local_op(
            &mut shared,
            OperationKind::Delete,
            Collection::Products,
            "p1",
            serde_json::Value::Null,
        )
        .await;
        let outcome = shared.apply_op(delete).await.unwrap();
        assert!(outcome.cache_changed);

        let again = local_op(
            &mut shared,
            OperationKind::Delete,
            Collection::Products,
            "p1",
            serde_json::Value::Null,
        )
        .await;
        let outcome = shared.apply_op(again).await.unwrap();
        assert!(!outcome.cache_changed);
    }

    #[tokio::test]
    async fn test_kind_collection_mismatch_is_rejected() {
        let mut shared = shared().await;
        let op = local_op(
            &mut shared,
            OperationKind::UpdateBalance,
            Collection::Products,
            "p1",
            json!({}),
        )
        .await;
        assert!(shared.apply_op(op).await.is_err());
    }
}
