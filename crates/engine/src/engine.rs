//! The engine facade: one owned instance per organization context, with an
//! explicit lifecycle. Construction spawns the background tasks;
//! `shutdown` cancels them and leaves everything flushed.

use crate::bundle::{
    assignment_sale_bundle, charge_bundle, charge_delete_bundle, charge_update_bundle,
    organization_update_bundle, player_payment_bundle,
};
use crate::cache::LocalCache;
use crate::clock::DeviceClock;
use crate::config::EngineConfig;
use crate::drain::{run_drain, DrainOutcome};
use crate::hydrator::{hydrate_all, hydrate_collection};
use crate::outbox::Outbox;
use crate::provisional::{BalanceDelta, ProvisionalStore, WithOverlay};
use crate::resolver::Resolver;
use crate::scheduler::spawn_tasks;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tillsync_api::{KvStore, NetworkMonitor, RemoteStore, SyncStatus};
use tillsync_types::error::EngineError;
use tillsync_types::time::now_ms;
use tillsync_types::{
    Assignment, Charge, ChargeReason, ChargeStatus, Collection, EntityId, EntityRef, Money,
    Operation, OperationKind, OrganizationSettings, Player, Product, Report, Source, StaffUser,
    TimestampMs, VersionMeta,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub(crate) struct OrgContext {
    pub org_id: String,
    pub user_key: String,
}

/// All engine state, serialised behind one async mutex. Every mutation
/// acquires it for the duration of its cache+outbox update, which is what
/// keeps the two coherent between suspension points.
pub struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) context: Option<OrgContext>,
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) network: Arc<dyn NetworkMonitor>,
    pub(crate) clock: DeviceClock,
    pub(crate) cache: LocalCache,
    pub(crate) provisional: ProvisionalStore,
    pub(crate) outbox: Outbox,
    /// Post-login mode: the next hydration pass wins all conflicts.
    pub(crate) force_server: bool,
    /// The sole mutual-exclusion primitive for drains.
    pub(crate) is_syncing: bool,
    pub(crate) sync_started_at: Option<TimestampMs>,
    pub(crate) last_full_hydration: TimestampMs,
}

impl EngineShared {
    pub(crate) fn resolver(&self) -> Resolver {
        Resolver::new(self.force_server, self.config.concurrency_window_ms)
    }

    pub(crate) fn org_id(&self) -> Result<&str, EngineError> {
        self.context
            .as_ref()
            .map(|c| c.org_id.as_str())
            .ok_or(EngineError::NoOrganization)
    }

    /// Entity ids the hydrator must not sweep as remote deletions: anything
    /// still referenced by uncommitted local work.
    pub(crate) fn protected_entity_ids(&self) -> HashSet<EntityId> {
        let mut protected = self.provisional.pending_entity_ids();
        protected.extend(self.outbox.referenced_entity_ids());
        for pending in self.outbox.pending_bundles() {
            for entity_ref in pending.bundle.entity_refs.values() {
                match entity_ref {
                    EntityRef::One(id) => {
                        protected.insert(id.clone());
                    }
                    EntityRef::Many(ids) => protected.extend(ids.iter().cloned()),
                }
            }
        }
        protected
    }
}

/// Input for a new product row.
#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub category: String,
    pub price: Money,
    pub stock: i64,
}

/// Input for a new player row.
#[derive(Debug, Clone)]
pub struct NewPlayer {
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone)]
pub struct NewStaffUser {
    pub name: String,
    pub email: Option<String>,
    pub role: String,
}

#[derive(Debug, Clone)]
pub struct NewReport {
    pub title: String,
    pub payload: serde_json::Value,
}

/// Input for an assignment sale.
#[derive(Debug, Clone)]
pub struct SaleRequest {
    pub product_id: EntityId,
    pub player_id: EntityId,
    pub quantity: i64,
}

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub player_id: EntityId,
    pub amount: Money,
    pub reason: ChargeReason,
    pub related_assignment_id: Option<EntityId>,
}

/// The offline-first synchronization engine.
pub struct SyncEngine {
    shared: Arc<Mutex<EngineShared>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Builds the engine and spawns its background tasks. No organization
    /// is bound yet; every data operation fails with `NoOrganization` until
    /// [`set_organization`](Self::set_organization) is called.
    pub async fn new(
        config: EngineConfig,
        kv: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteStore>,
        network: Arc<dyn NetworkMonitor>,
    ) -> Result<Self, EngineError> {
        let clock = DeviceClock::load(kv.clone()).await?;
        let cache = LocalCache::new(kv.clone());
        let provisional = ProvisionalStore::load(kv.clone()).await?;
        let outbox = Outbox::load(kv.clone()).await?;

        let shared = Arc::new(Mutex::new(EngineShared {
            config,
            context: None,
            kv,
            remote,
            network,
            clock,
            cache,
            provisional,
            outbox,
            force_server: false,
            is_syncing: false,
            sync_started_at: None,
            last_full_hydration: 0,
        }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = spawn_tasks(shared.clone(), shutdown_rx);

        Ok(Self {
            shared,
            shutdown_tx,
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    /// Binds the organization context, filters stale outbox entries, and
    /// runs the startup hydration when online.
    pub async fn set_organization(
        &self,
        org_id: impl Into<String>,
        user_key: impl Into<String>,
    ) -> Result<(), EngineError> {
        let online = {
            let mut guard = self.shared.lock().await;
            guard.context = Some(OrgContext {
                org_id: org_id.into(),
                user_key: user_key.into(),
            });

            let mut known: HashMap<Collection, HashSet<EntityId>> = HashMap::new();
            for collection in Collection::all() {
                known.insert(collection, guard.cache.ids(collection).await?);
            }
            let config = guard.config.clone();
            let dropped = guard
                .outbox
                .filter_on_load(&known, now_ms(), &config)
                .await?;
            if dropped > 0 {
                tracing::info!(target: "engine", dropped, "outbox filtered on load");
            }
            guard.network.is_online()
        };

        if online {
            hydrate_all(&self.shared, false).await?;
            let _ = run_drain(&self.shared).await;
        }
        Ok(())
    }

    /// Stops the background tasks and waits for them to finish. All queues
    /// and clocks are already durable; there is nothing else to flush.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ---- single-entity writes ----

    pub async fn create_product(&self, input: NewProduct) -> Result<Product, EngineError> {
        let product = {
            let mut guard = self.shared.lock().await;
            let org_id = guard.org_id()?.to_string();
            let meta = guard.clock.next_meta(Source::Local).await?;
            let product = Product {
                id: DeviceClock::new_id(),
                organization_id: org_id,
                name: input.name,
                category: input.category,
                price: input.price,
                stock: input.stock,
                is_active: true,
                created_at: meta.timestamp,
                updated_at: meta.timestamp,
                version: version_from(&meta),
            };
            let op = Operation {
                id: DeviceClock::new_id(),
                kind: OperationKind::Create,
                collection: Collection::Products,
                entity_id: Some(product.id.clone()),
                data: serde_json::to_value(&product)?,
                metadata: meta,
            };
            guard.apply_op(op).await?;
            product
        };
        self.kick_sync().await;
        Ok(product)
    }

    pub async fn create_player(&self, input: NewPlayer) -> Result<Player, EngineError> {
        let player = {
            let mut guard = self.shared.lock().await;
            let org_id = guard.org_id()?.to_string();
            let meta = guard.clock.next_meta(Source::Local).await?;
            let name = format!("{} {}", input.first_name, input.last_name);
            let player = Player {
                id: DeviceClock::new_id(),
                organization_id: org_id,
                first_name: input.first_name,
                last_name: input.last_name,
                name,
                balance: 0,
                total_purchases: 0,
                total_spent: 0,
                is_active: true,
                last_purchase_date: None,
                created_at: meta.timestamp,
                updated_at: meta.timestamp,
                version: version_from(&meta),
            };
            let op = Operation {
                id: DeviceClock::new_id(),
                kind: OperationKind::Create,
                collection: Collection::Players,
                entity_id: Some(player.id.clone()),
                data: serde_json::to_value(&player)?,
                metadata: meta,
            };
            guard.apply_op(op).await?;
            player
        };
        self.kick_sync().await;
        Ok(player)
    }

    pub async fn create_staff_user(&self, input: NewStaffUser) -> Result<StaffUser, EngineError> {
        let staff = {
            let mut guard = self.shared.lock().await;
            let org_id = guard.org_id()?.to_string();
            let meta = guard.clock.next_meta(Source::Local).await?;
            let staff = StaffUser {
                id: DeviceClock::new_id(),
                organization_id: org_id,
                name: input.name,
                email: input.email,
                role: input.role,
                is_active: true,
                created_at: meta.timestamp,
                updated_at: meta.timestamp,
                version: version_from(&meta),
            };
            let op = Operation {
                id: DeviceClock::new_id(),
                kind: OperationKind::Create,
                collection: Collection::StaffUsers,
                entity_id: Some(staff.id.clone()),
                data: serde_json::to_value(&staff)?,
                metadata: meta,
            };
            guard.apply_op(op).await?;
            staff
        };
        self.kick_sync().await;
        Ok(staff)
    }

    pub async fn create_report(&self, input: NewReport) -> Result<Report, EngineError> {
        let report = {
            let mut guard = self.shared.lock().await;
            let org_id = guard.org_id()?.to_string();
            let meta = guard.clock.next_meta(Source::Local).await?;
            let report = Report {
                id: DeviceClock::new_id(),
                organization_id: org_id,
                title: input.title,
                payload: input.payload,
                created_at: meta.timestamp,
                updated_at: meta.timestamp,
                version: version_from(&meta),
            };
            let op = Operation {
                id: DeviceClock::new_id(),
                kind: OperationKind::Create,
                collection: Collection::Reports,
                entity_id: Some(report.id.clone()),
                data: serde_json::to_value(&report)?,
                metadata: meta,
            };
            guard.apply_op(op).await?;
            report
        };
        self.kick_sync().await;
        Ok(report)
    }

    /// Field update on a cached entity. Charges and organizations are
    /// rejected: their writes only travel inside bundles, and a single
    /// operation on them would never reach the remote.
    pub async fn update_entity(
        &self,
        collection: Collection,
        entity_id: &str,
        updates: serde_json::Value,
    ) -> Result<(), EngineError> {
        if matches!(collection, Collection::Charges | Collection::Organizations) {
            return Err(EngineError::BundleRequired(collection));
        }
        {
            let mut guard = self.shared.lock().await;
            guard.org_id()?;
            let meta = guard.clock.next_meta(Source::Local).await?;
            let op = Operation {
                id: DeviceClock::new_id(),
                kind: OperationKind::Update,
                collection,
                entity_id: Some(entity_id.to_string()),
                data: updates,
                metadata: meta,
            };
            guard.apply_op(op).await?;
        }
        self.kick_sync().await;
        Ok(())
    }

    /// Soft delete is the caller's business (`update_entity` with
    /// `isActive: false`); this removes the local row and queues the remote
    /// delete.
    pub async fn delete_entity(
        &self,
        collection: Collection,
        entity_id: &str,
    ) -> Result<(), EngineError> {
        if matches!(collection, Collection::Charges | Collection::Organizations) {
            return Err(EngineError::BundleRequired(collection));
        }
        {
            let mut guard = self.shared.lock().await;
            guard.org_id()?;
            let meta = guard.clock.next_meta(Source::Local).await?;
            let op = Operation {
                id: DeviceClock::new_id(),
                kind: OperationKind::Delete,
                collection,
                entity_id: Some(entity_id.to_string()),
                data: serde_json::Value::Null,
                metadata: meta,
            };
            guard.apply_op(op).await?;
        }
        self.kick_sync().await;
        Ok(())
    }

    /// Free-standing balance adjustment. Immediate visibility comes from
    /// the provisional overlay; the base cache moves only when the remote
    /// acknowledges the operation.
    pub async fn adjust_player_balance(
        &self,
        player_id: &str,
        delta: Money,
    ) -> Result<(), EngineError> {
        {
            let mut guard = self.shared.lock().await;
            guard.org_id()?;
            if guard.cache.find::<Player>(player_id).await?.is_none() {
                return Err(EngineError::UnknownEntity {
                    collection: Collection::Players,
                    id: player_id.to_string(),
                });
            }
            let meta = guard.clock.next_meta(Source::Local).await?;
            let op_id = DeviceClock::new_id();
            guard
                .provisional
                .add_balance_delta(
                    player_id,
                    BalanceDelta {
                        delta,
                        op_id: op_id.clone(),
                        timestamp: meta.timestamp,
                        bundle_kind: None,
                    },
                )
                .await?;
            let op = Operation {
                id: op_id,
                kind: OperationKind::UpdateBalance,
                collection: Collection::Players,
                entity_id: Some(player_id.to_string()),
                data: json!({"playerId": player_id, "delta": delta}),
                metadata: meta,
            };
            guard.apply_op(op).await?;
        }
        self.kick_sync().await;
        Ok(())
    }

    // ---- bundles ----

    /// Rings up a sale: assignment row, stock decrement, debt increment,
    /// all one atomic bundle.
    pub async fn create_assignment_sale(
        &self,
        request: SaleRequest,
    ) -> Result<Assignment, EngineError> {
        if request.quantity <= 0 {
            return Err(EngineError::Validation(
                "sale quantity must be positive".into(),
            ));
        }
        let assignment = {
            let mut guard = self.shared.lock().await;
            let org_id = guard.org_id()?.to_string();
            let product = guard
                .cache
                .find::<Product>(&request.product_id)
                .await?
                .ok_or_else(|| EngineError::UnknownEntity {
                    collection: Collection::Products,
                    id: request.product_id.clone(),
                })?;
            let player = guard
                .cache
                .find::<Player>(&request.player_id)
                .await?
                .ok_or_else(|| EngineError::UnknownEntity {
                    collection: Collection::Players,
                    id: request.player_id.clone(),
                })?;

            let meta = guard.clock.next_meta(Source::Local).await?;
            let assignment = Assignment {
                id: DeviceClock::new_id(),
                organization_id: org_id,
                player_id: player.id.clone(),
                product_id: product.id.clone(),
                user_name: player.name.clone(),
                product_name: product.name.clone(),
                quantity: request.quantity,
                unit_price: product.price,
                total: product.price * request.quantity,
                paid: false,
                cancelled: false,
                date: meta.timestamp,
                created_at: meta.timestamp,
                updated_at: meta.timestamp,
                version: version_from(&meta),
            };
            let bundle = assignment_sale_bundle(&assignment, &meta);
            guard.stage_bundle(&bundle).await?;
            assignment
        };
        self.kick_sync().await;
        Ok(assignment)
    }

    pub async fn create_charge(&self, request: ChargeRequest) -> Result<Charge, EngineError> {
        let charge = {
            let mut guard = self.shared.lock().await;
            let org_id = guard.org_id()?.to_string();
            if guard
                .cache
                .find::<Player>(&request.player_id)
                .await?
                .is_none()
            {
                return Err(EngineError::UnknownEntity {
                    collection: Collection::Players,
                    id: request.player_id.clone(),
                });
            }
            let meta = guard.clock.next_meta(Source::Local).await?;
            let charge = Charge {
                id: DeviceClock::new_id(),
                organization_id: org_id,
                player_id: request.player_id,
                amount: request.amount,
                reason: request.reason,
                status: ChargeStatus::Pending,
                related_assignment_id: request.related_assignment_id,
                created_at: meta.timestamp,
                updated_at: meta.timestamp,
                version: version_from(&meta),
            };
            let bundle = charge_bundle(&charge, &meta);
            guard.stage_bundle(&bundle).await?;
            charge
        };
        self.kick_sync().await;
        Ok(charge)
    }

    /// Settles a player's unpaid assignments and relieves the matching
    /// debt. Returns the settled total.
    pub async fn create_player_payment(
        &self,
        player_id: &str,
        assignment_ids: &[EntityId],
    ) -> Result<Money, EngineError> {
        if assignment_ids.is_empty() {
            return Err(EngineError::EmptyPayment);
        }
        let total = {
            let mut guard = self.shared.lock().await;
            guard.org_id()?;
            let rows = guard.cache.rows::<Assignment>().await?;
            let wanted: HashSet<&EntityId> = assignment_ids.iter().collect();
            let assignments: Vec<Assignment> = rows
                .into_iter()
                .filter(|a| {
                    wanted.contains(&a.id) && a.player_id == player_id && !a.paid && !a.cancelled
                })
                .collect();
            if assignments.is_empty() {
                return Err(EngineError::EmptyPayment);
            }
            let meta = guard.clock.next_meta(Source::Local).await?;
            let bundle = player_payment_bundle(player_id, &assignments, &meta);
            guard.stage_bundle(&bundle).await?;
            assignments.iter().map(|a| a.total).sum()
        };
        self.kick_sync().await;
        Ok(total)
    }

    pub async fn update_charge_status(
        &self,
        charge_id: &str,
        status: ChargeStatus,
    ) -> Result<(), EngineError> {
        {
            let mut guard = self.shared.lock().await;
            guard.org_id()?;
            let charge = guard
                .cache
                .find::<Charge>(charge_id)
                .await?
                .ok_or_else(|| EngineError::UnknownEntity {
                    collection: Collection::Charges,
                    id: charge_id.to_string(),
                })?;
            let meta = guard.clock.next_meta(Source::Local).await?;
            let bundle = charge_update_bundle(&charge, status, &meta);
            guard.stage_bundle(&bundle).await?;
        }
        self.kick_sync().await;
        Ok(())
    }

    pub async fn delete_charge(&self, charge_id: &str) -> Result<(), EngineError> {
        {
            let mut guard = self.shared.lock().await;
            guard.org_id()?;
            let charge = guard
                .cache
                .find::<Charge>(charge_id)
                .await?
                .ok_or_else(|| EngineError::UnknownEntity {
                    collection: Collection::Charges,
                    id: charge_id.to_string(),
                })?;
            let meta = guard.clock.next_meta(Source::Local).await?;
            let bundle = charge_delete_bundle(&charge, &meta);
            guard.stage_bundle(&bundle).await?;
        }
        self.kick_sync().await;
        Ok(())
    }

    pub async fn update_organization(
        &self,
        updates: serde_json::Value,
    ) -> Result<(), EngineError> {
        {
            let mut guard = self.shared.lock().await;
            let org_id = guard.org_id()?.to_string();
            let meta = guard.clock.next_meta(Source::Local).await?;
            let bundle = organization_update_bundle(&org_id, updates, &meta);
            guard.stage_bundle(&bundle).await?;
        }
        self.kick_sync().await;
        Ok(())
    }

    // ---- reads ----

    pub async fn products_with_overlay(&self) -> Result<Vec<WithOverlay<Product>>, EngineError> {
        let guard = self.shared.lock().await;
        let rows = guard.cache.rows::<Product>().await?;
        Ok(guard.provisional.fold_products(&rows))
    }

    pub async fn players_with_overlay(&self) -> Result<Vec<WithOverlay<Player>>, EngineError> {
        let guard = self.shared.lock().await;
        let rows = guard.cache.rows::<Player>().await?;
        Ok(guard.provisional.fold_players(&rows))
    }

    pub async fn assignments_with_overlay(
        &self,
    ) -> Result<Vec<WithOverlay<Assignment>>, EngineError> {
        let guard = self.shared.lock().await;
        let rows = guard.cache.rows::<Assignment>().await?;
        Ok(guard.provisional.fold_assignments(&rows))
    }

    pub async fn charges_with_overlay(&self) -> Result<Vec<WithOverlay<Charge>>, EngineError> {
        let guard = self.shared.lock().await;
        let rows = guard.cache.rows::<Charge>().await?;
        Ok(guard.provisional.fold_charges(&rows))
    }

    pub async fn organization_with_overlay(
        &self,
    ) -> Result<Option<WithOverlay<OrganizationSettings>>, EngineError> {
        let guard = self.shared.lock().await;
        let org_id = guard.org_id()?.to_string();
        let rows = guard.cache.rows::<OrganizationSettings>().await?;
        let base = rows.into_iter().find(|o| o.id == org_id);
        Ok(guard.provisional.fold_organization(base))
    }

    pub async fn staff_users(&self) -> Result<Vec<StaffUser>, EngineError> {
        let guard = self.shared.lock().await;
        Ok(guard.cache.rows::<StaffUser>().await?)
    }

    pub async fn reports(&self) -> Result<Vec<Report>, EngineError> {
        let guard = self.shared.lock().await;
        Ok(guard.cache.rows::<Report>().await?)
    }

    // ---- sync control & introspection ----

    /// One immediate drain pass, regardless of timers.
    pub async fn drain_now(&self) -> Result<DrainOutcome, EngineError> {
        run_drain(&self.shared).await
    }

    /// One immediate hydration pass over every collection.
    pub async fn hydrate_now(&self) -> Result<(), EngineError> {
        hydrate_all(&self.shared, false).await
    }

    /// Post-login hydration: the server snapshot wins every conflict.
    pub async fn hydrate_authoritative(&self) -> Result<(), EngineError> {
        hydrate_all(&self.shared, true).await
    }

    /// Hydrates a single collection.
    pub async fn hydrate_collection_now(&self, collection: Collection) -> Result<(), EngineError> {
        hydrate_collection(&self.shared, collection, false).await
    }

    pub async fn status(&self) -> SyncStatus {
        let guard = self.shared.lock().await;
        SyncStatus {
            is_online: guard.network.is_online(),
            is_syncing: guard.is_syncing,
            main_queue_length: guard.outbox.queue_len(),
            dead_letter_queue_length: guard.outbox.dlq_len(),
            pending_bundles: guard.outbox.bundle_len(),
            oldest_operation_age_ms: guard.outbox.oldest_age_ms(now_ms()),
        }
    }

    /// Attempts an immediate push after a local write; failures stay in the
    /// outbox for the background cadences.
    async fn kick_sync(&self) {
        let online = { self.shared.lock().await.network.is_online() };
        if !online {
            return;
        }
        if let Err(error) = run_drain(&self.shared).await {
            tracing::debug!(target: "engine", error = %error, "opportunistic drain failed");
        }
    }
}

fn version_from(meta: &tillsync_types::OperationMeta) -> VersionMeta {
    VersionMeta {
        device_id: meta.device_id.clone(),
        counter: meta.version,
        timestamp: meta.timestamp,
        vector_clock: meta.vector_clock.clone(),
    }
}
