//! Shop entities. Each cached entity carries the version metadata the
//! conflict resolver needs, and serialises with camelCase field names — the
//! wire shape shared with the mobile clients and the remote document store.

use crate::clock::VectorClock;
use crate::{DeviceId, EntityId, Money, TimestampMs};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version metadata attached to every cached entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMeta {
    pub device_id: DeviceId,
    pub counter: u64,
    pub timestamp: TimestampMs,
    #[serde(default)]
    pub vector_clock: VectorClock,
}

/// The seven cached collections, each stored as one blob under a stable key
/// and mirrored as a remote collection of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Collection {
    Products,
    Players,
    StaffUsers,
    Assignments,
    Reports,
    Charges,
    Organizations,
}

impl Collection {
    /// Stable storage/remote key for the collection.
    pub fn key(&self) -> &'static str {
        match self {
            Collection::Products => "products",
            Collection::Players => "players",
            Collection::StaffUsers => "staff-users",
            Collection::Assignments => "assignments",
            Collection::Reports => "reports",
            Collection::Charges => "charges",
            Collection::Organizations => "organizations",
        }
    }

    pub fn all() -> [Collection; 7] {
        [
            Collection::Products,
            Collection::Players,
            Collection::StaffUsers,
            Collection::Assignments,
            Collection::Reports,
            Collection::Charges,
            Collection::Organizations,
        ]
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Common surface every cached entity exposes to the cache, the applier, and
/// the conflict resolver.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> &EntityId;
    fn updated_at(&self) -> TimestampMs;
    fn set_updated_at(&mut self, ts: TimestampMs);
    fn version(&self) -> &VersionMeta;
    fn version_mut(&mut self) -> &mut VersionMeta;

    /// Shallow-merges a JSON patch into this entity. Unknown fields in the
    /// patch are carried through serde; fields absent from the patch keep
    /// their current value.
    fn merge_fields(&mut self, patch: &serde_json::Value) -> Result<(), serde_json::Error> {
        let mut current = serde_json::to_value(&*self)?;
        if let (Some(base), Some(updates)) = (current.as_object_mut(), patch.as_object()) {
            for (key, value) in updates {
                base.insert(key.clone(), value.clone());
            }
        }
        *self = serde_json::from_value(current)?;
        Ok(())
    }
}

macro_rules! impl_entity {
    ($ty:ty, $collection:expr) => {
        impl Entity for $ty {
            const COLLECTION: Collection = $collection;

            fn id(&self) -> &EntityId {
                &self.id
            }
            fn updated_at(&self) -> TimestampMs {
                self.updated_at
            }
            fn set_updated_at(&mut self, ts: TimestampMs) {
                self.updated_at = ts;
            }
            fn version(&self) -> &VersionMeta {
                &self.version
            }
            fn version_mut(&mut self) -> &mut VersionMeta {
                &mut self.version
            }
        }
    };
}

/// A product on the shelf. `stock` is an integer quantity mutated only by
/// stock deltas or stock-take rebases, never by direct field writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: EntityId,
    pub organization_id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    pub price: Money,
    pub stock: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    #[serde(default)]
    pub version: VersionMeta,
}

impl_entity!(Product, Collection::Products);

/// A club member buying on credit. `balance` is outstanding debt; positive
/// means owed to the shop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: EntityId,
    pub organization_id: String,
    pub first_name: String,
    pub last_name: String,
    /// Derived display name, denormalised so lists render without joins.
    pub name: String,
    pub balance: Money,
    #[serde(default)]
    pub total_purchases: i64,
    #[serde(default)]
    pub total_spent: Money,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_purchase_date: Option<TimestampMs>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    #[serde(default)]
    pub version: VersionMeta,
}

impl_entity!(Player, Collection::Players);

/// A sale record. Immutable once written, except for the `paid` and
/// `cancelled` flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: EntityId,
    pub organization_id: String,
    pub player_id: EntityId,
    pub product_id: EntityId,
    /// Denormalised display values; survive deletion of the referent.
    pub user_name: String,
    pub product_name: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub total: Money,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub cancelled: bool,
    pub date: TimestampMs,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    #[serde(default)]
    pub version: VersionMeta,
}

impl_entity!(Assignment, Collection::Assignments);

/// Why a charge was raised against a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChargeReason {
    OwedSale,
    Fine,
    RegularFee,
    Payment,
    Refund,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChargeStatus {
    Pending,
    Paid,
}

/// A signed money movement against a player's balance. Positive amounts
/// increase debt; negative amounts decrease it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Charge {
    pub id: EntityId,
    pub organization_id: String,
    pub player_id: EntityId,
    pub amount: Money,
    pub reason: ChargeReason,
    pub status: ChargeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_assignment_id: Option<EntityId>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    #[serde(default)]
    pub version: VersionMeta,
}

impl_entity!(Charge, Collection::Charges);

/// Per-organization settings: a handful of known fields plus free-form
/// key-value extras carried verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationSettings {
    pub id: EntityId,
    pub organization_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: TimestampMs,
    #[serde(default)]
    pub updated_at: TimestampMs,
    #[serde(default)]
    pub version: VersionMeta,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl_entity!(OrganizationSettings, Collection::Organizations);

/// A staff login known to this organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffUser {
    pub id: EntityId,
    pub organization_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    #[serde(default)]
    pub version: VersionMeta,
}

impl_entity!(StaffUser, Collection::StaffUsers);

/// An opaque report record. Cached and hydrated like any other collection;
/// the engine attaches no semantics to the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: EntityId,
    pub organization_id: String,
    pub title: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    #[serde(default)]
    pub version: VersionMeta,
}

impl_entity!(Report, Collection::Reports);

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product() -> Product {
        Product {
            id: "p1".into(),
            organization_id: "org".into(),
            name: "Water".into(),
            category: "drinks".into(),
            price: 150,
            stock: 10,
            is_active: true,
            created_at: 1_000,
            updated_at: 1_000,
            version: VersionMeta::default(),
        }
    }

    #[test]
    fn test_merge_fields_shallow() {
        let mut p = product();
        p.merge_fields(&json!({"name": "Sparkling water", "price": 200}))
            .unwrap();
        assert_eq!(p.name, "Sparkling water");
        assert_eq!(p.price, 200);
        assert_eq!(p.stock, 10);
    }

    #[test]
    fn test_merge_fields_ignores_missing() {
        let mut p = product();
        p.merge_fields(&json!({})).unwrap();
        assert_eq!(p, product());
    }

    #[test]
    fn test_entity_round_trips_camel_case() {
        let p = product();
        let value = serde_json::to_value(&p).unwrap();
        assert!(value.get("isActive").is_some());
        assert!(value.get("createdAt").is_some());
        let back: Product = serde_json::from_value(value).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_entity_decodes_without_version() {
        let raw = json!({
            "id": "p2",
            "organizationId": "org",
            "name": "Crisps",
            "price": 90,
            "stock": 4,
            "createdAt": 5,
            "updatedAt": 6
        });
        let p: Product = serde_json::from_value(raw).unwrap();
        assert_eq!(p.version, VersionMeta::default());
        assert!(p.is_active);
    }

    #[test]
    fn test_organization_extra_fields_survive() {
        let raw = json!({
            "id": "org",
            "organizationId": "org",
            "name": "Clubhouse",
            "currency": "GBP",
            "openingHours": "9-5"
        });
        let settings: OrganizationSettings = serde_json::from_value(raw).unwrap();
        assert_eq!(
            settings.extra.get("openingHours"),
            Some(&json!("9-5"))
        );
        let back = serde_json::to_value(&settings).unwrap();
        assert_eq!(back.get("openingHours"), Some(&json!("9-5")));
    }
}
