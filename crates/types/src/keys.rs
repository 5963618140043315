//! The durable store's key map. Every blob the engine persists lives under
//! one of these string keys.

use crate::Collection;

pub const DEVICE_ID: &str = "device_id";
pub const VECTOR_CLOCK: &str = "vector_clock";
pub const SYNC_QUEUE: &str = "sync_queue";
pub const DEAD_LETTER_QUEUE: &str = "dead_letter_queue";
pub const PENDING_BUNDLES: &str = "pending_bundles";
pub const PROCESSED_IDS: &str = "processed_ids";

pub const PROVISIONAL_STOCK_DELTAS: &str = "provisional_stock_deltas";
pub const PROVISIONAL_BALANCE_DELTAS: &str = "provisional_balance_deltas";
pub const PROVISIONAL_ASSIGNMENTS: &str = "provisional_assignments";
pub const PROVISIONAL_ASSIGNMENT_UPDATES: &str = "provisional_assignment_updates";
pub const PROVISIONAL_ORGANIZATION_UPDATES: &str = "provisional_organization_updates";
pub const PROVISIONAL_CHARGES: &str = "provisional_charges";

/// Blob key for a cached collection.
pub fn collection_key(collection: Collection) -> &'static str {
    collection.key()
}

/// Marker set once the collection has completed its first hydration for this
/// user context.
pub fn cache_initialized_key(collection: Collection, user_key: &str) -> String {
    format!("cache_initialized_{}_{}", collection.key(), user_key)
}

/// Timestamp of the last successful hydration of a collection.
pub fn last_sync_key(collection: Collection) -> String {
    format!("last_sync_{}", collection.key())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_keys_are_stable() {
        assert_eq!(
            cache_initialized_key(Collection::Products, "user-1"),
            "cache_initialized_products_user-1"
        );
        assert_eq!(last_sync_key(Collection::StaffUsers), "last_sync_staff-users");
    }
}
