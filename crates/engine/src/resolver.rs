//! Conflict resolution between a cached entity and an incoming update.
//!
//! Decisions are pure functions of the two sides, so any two devices
//! presented with the same pair converge on the same answer. The rules run
//! in a fixed order; the first that fires wins.

use tillsync_types::{ClockOrdering, Entity, OperationMeta, Player, Product, Source};

/// What the applier should do with the incoming update.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    /// Merge the incoming fields over the current row.
    Accept,
    /// Keep the current row untouched.
    Reject(&'static str),
    /// Replace the current row with an additively merged one.
    Merge(T),
}

#[derive(Debug, Clone, Copy)]
pub struct Resolver {
    /// Post-login mode: the server snapshot is authoritative and wins
    /// unconditionally.
    pub force_server: bool,
    /// Updates within this window count as concurrent for additive merging.
    pub concurrency_window_ms: i64,
}

impl Resolver {
    pub fn new(force_server: bool, concurrency_window_ms: i64) -> Self {
        Self {
            force_server,
            concurrency_window_ms,
        }
    }

    /// Resolution for entities with no additively merged fields.
    pub fn resolve<T: Entity>(
        &self,
        current: &T,
        incoming: &OperationMeta,
    ) -> Resolution<T> {
        self.resolve_with(current, incoming, || None)
    }

    /// Product resolution: concurrent `stock` changes merge additively.
    pub fn resolve_product(
        &self,
        current: &Product,
        patch: &serde_json::Value,
        incoming: &OperationMeta,
    ) -> Resolution<Product> {
        self.resolve_with(current, incoming, || {
            additive_product(current, patch, incoming)
        })
    }

    /// Player resolution: concurrent `balance` changes merge additively.
    pub fn resolve_player(
        &self,
        current: &Player,
        patch: &serde_json::Value,
        incoming: &OperationMeta,
    ) -> Resolution<Player> {
        self.resolve_with(current, incoming, || additive_player(current, patch, incoming))
    }

    fn resolve_with<T: Entity, F>(
        &self,
        current: &T,
        incoming: &OperationMeta,
        additive: F,
    ) -> Resolution<T>
    where
        F: FnOnce() -> Option<T>,
    {
        let current_ts = current.updated_at();

        // 1. Force-server mode.
        if self.force_server && incoming.source == Source::Server {
            return Resolution::Accept;
        }

        // 2 & 3. Server-sourced updates win on newer timestamps and lose on
        // older ones, which is what preserves offline edits. Equal stamps
        // fall through to the clock rules.
        if incoming.source == Source::Server {
            if incoming.timestamp > current_ts {
                return Resolution::Accept;
            }
            if incoming.timestamp < current_ts {
                return Resolution::Reject("server update older than local row");
            }
        }

        // 4. Additive candidates: both sides moved a materialised numeric
        // field and the updates are close enough in time to be concurrent.
        if (incoming.timestamp - current_ts).abs() <= self.concurrency_window_ms {
            if let Some(merged) = additive() {
                tracing::debug!(target: "resolver", id = %current.id(), "additive merge");
                return Resolution::Merge(merged);
            }
        }

        // 5. Strict newer timestamp.
        if incoming.timestamp > current_ts {
            return Resolution::Accept;
        }

        // 6. Equal timestamps: fall back to causality, then to the
        // counter-sum approximation for genuinely concurrent clocks.
        if incoming.timestamp == current_ts {
            let current_clock = &current.version().vector_clock;
            return match incoming.vector_clock.compare(current_clock) {
                ClockOrdering::After => Resolution::Accept,
                ClockOrdering::Before => Resolution::Reject("incoming causally older"),
                ClockOrdering::Equal => Resolution::Reject("no causal change"),
                ClockOrdering::Concurrent => {
                    if incoming.vector_clock.counter_sum() > current_clock.counter_sum() {
                        Resolution::Accept
                    } else {
                        Resolution::Reject("concurrent, current side retained")
                    }
                }
            };
        }

        // 7. Older and nothing else fired.
        Resolution::Reject("incoming older than local row")
    }
}

/// Concurrent stock conflict: additions must not be erased by sales, so the
/// higher value survives. Non-numeric fields follow whichever side is
/// newer; totals are irrelevant to products.
fn additive_product(
    current: &Product,
    patch: &serde_json::Value,
    incoming: &OperationMeta,
) -> Option<Product> {
    let incoming_stock = patch.get("stock").and_then(|v| v.as_i64())?;
    if incoming_stock == current.stock {
        return None;
    }
    let mut merged = current.clone();
    if incoming.timestamp >= current.updated_at() {
        if merged.merge_fields(patch).is_err() {
            return None;
        }
    }
    merged.stock = current.stock.max(incoming_stock);
    finish_merge(&mut merged, current.updated_at(), incoming);
    Some(merged)
}

/// Concurrent balance conflict. A decrease is a payment or a settled sale,
/// a rise is new debt; either way the side that moved the value carries the
/// intent, so its balance is adopted. Totals only ever grow, so they take
/// the max of both sides.
fn additive_player(
    current: &Player,
    patch: &serde_json::Value,
    incoming: &OperationMeta,
) -> Option<Player> {
    let incoming_balance = patch.get("balance").and_then(|v| v.as_i64())?;
    if incoming_balance == current.balance {
        return None;
    }
    let mut merged = current.clone();
    if incoming.timestamp >= current.updated_at() {
        if merged.merge_fields(patch).is_err() {
            return None;
        }
    }
    merged.balance = incoming_balance;
    merged.total_spent = current
        .total_spent
        .max(patch.get("totalSpent").and_then(|v| v.as_i64()).unwrap_or(0));
    merged.total_purchases = current.total_purchases.max(
        patch
            .get("totalPurchases")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    );
    finish_merge(&mut merged, current.updated_at(), incoming);
    Some(merged)
}

fn finish_merge<T: Entity>(merged: &mut T, current_ts: i64, incoming: &OperationMeta) {
    merged.set_updated_at(current_ts.max(incoming.timestamp));
    let version = merged.version_mut();
    version.vector_clock.merge(&incoming.vector_clock);
    version.timestamp = current_ts.max(incoming.timestamp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tillsync_types::{VectorClock, VersionMeta};

    const WINDOW: i64 = 5 * 60 * 1000;

    fn meta(source: Source, timestamp: i64, clock: VectorClock) -> OperationMeta {
        OperationMeta {
            device_id: "dev-b".into(),
            timestamp,
            version: clock.get("dev-b"),
            vector_clock: clock,
            source,
        }
    }

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        VectorClock(pairs.iter().map(|(d, c)| (d.to_string(), *c)).collect())
    }

    fn product(stock: i64, updated_at: i64, vc: VectorClock) -> Product {
        Product {
            id: "p1".into(),
            organization_id: "org".into(),
            name: "Water".into(),
            category: String::new(),
            price: 200,
            stock,
            is_active: true,
            created_at: 0,
            updated_at,
            version: VersionMeta {
                device_id: "dev-a".into(),
                counter: vc.get("dev-a"),
                timestamp: updated_at,
                vector_clock: vc,
            },
        }
    }

    fn player(balance: i64, updated_at: i64) -> Player {
        Player {
            id: "q1".into(),
            organization_id: "org".into(),
            first_name: "A".into(),
            last_name: "B".into(),
            name: "A B".into(),
            balance,
            total_purchases: 2,
            total_spent: 700,
            is_active: true,
            last_purchase_date: None,
            created_at: 0,
            updated_at,
            version: VersionMeta::default(),
        }
    }

    #[test]
    fn test_force_server_wins_unconditionally() {
        let resolver = Resolver::new(true, WINDOW);
        let current = product(10, 2_000, clock(&[("dev-a", 5)]));
        // Even an ancient server row is accepted in force-server mode.
        let incoming = meta(Source::Server, 1, VectorClock::new());
        assert_eq!(resolver.resolve(&current, &incoming), Resolution::Accept);
    }

    #[test]
    fn test_server_newer_accepts_older_rejects() {
        let resolver = Resolver::new(false, WINDOW);
        let current = product(10, 2_000, clock(&[("dev-a", 5)]));
        // Outside the concurrency window so the additive rule stays quiet.
        let newer = meta(Source::Server, 2_000 + WINDOW + 1, VectorClock::new());
        let older = meta(Source::Server, 1_000, VectorClock::new());
        assert_eq!(resolver.resolve(&current, &newer), Resolution::Accept);
        assert!(matches!(
            resolver.resolve(&current, &older),
            Resolution::Reject(_)
        ));
    }

    #[test]
    fn test_additive_stock_takes_higher() {
        let resolver = Resolver::new(false, WINDOW);
        let current = product(12, 2_000, clock(&[("dev-a", 5)]));
        let incoming = meta(Source::Sync, 3_000, clock(&[("dev-b", 3)]));
        match resolver.resolve_product(&current, &json!({"stock": 8}), &incoming) {
            Resolution::Merge(merged) => {
                assert_eq!(merged.stock, 12);
                assert_eq!(merged.updated_at, 3_000);
                // Both clocks folded into the merged row.
                assert_eq!(merged.version.vector_clock.get("dev-a"), 5);
                assert_eq!(merged.version.vector_clock.get("dev-b"), 3);
            }
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[test]
    fn test_additive_balance_adopts_moved_value_and_maxes_totals() {
        let resolver = Resolver::new(false, WINDOW);
        let current = player(1_000, 2_000);
        let incoming = meta(Source::Sync, 2_500, clock(&[("dev-b", 1)]));
        let patch = json!({"balance": 700, "totalSpent": 900, "totalPurchases": 3});
        match resolver.resolve_player(&current, &patch, &incoming) {
            Resolution::Merge(merged) => {
                assert_eq!(merged.balance, 700);
                assert_eq!(merged.total_spent, 900);
                assert_eq!(merged.total_purchases, 3);
            }
            other => panic!("expected merge, got {other:?}"),
        }
    }

    #[test]
    fn test_additive_requires_concurrency_window() {
        let resolver = Resolver::new(false, WINDOW);
        let current = product(12, 2_000, clock(&[("dev-a", 5)]));
        let incoming = meta(Source::Sync, 2_000 + WINDOW + 1, clock(&[("dev-b", 3)]));
        // Outside the window the plain newer-timestamp rule fires instead.
        assert_eq!(
            resolver.resolve_product(&current, &json!({"stock": 8}), &incoming),
            Resolution::Accept
        );
    }

    #[test]
    fn test_strict_newer_accepts() {
        let resolver = Resolver::new(false, WINDOW);
        let current = player(0, 1_000);
        let incoming = meta(Source::Local, 2_000, clock(&[("dev-b", 1)]));
        assert_eq!(resolver.resolve(&current, &incoming), Resolution::Accept);
    }

    #[test]
    fn test_equal_timestamp_uses_clock_dominance() {
        let resolver = Resolver::new(false, WINDOW);
        let current = product(10, 2_000, clock(&[("dev-a", 2), ("dev-b", 1)]));

        let dominating = meta(Source::Sync, 2_000, clock(&[("dev-a", 2), ("dev-b", 2)]));
        assert_eq!(resolver.resolve(&current, &dominating), Resolution::Accept);

        let dominated = meta(Source::Sync, 2_000, clock(&[("dev-a", 1), ("dev-b", 1)]));
        assert!(matches!(
            resolver.resolve(&current, &dominated),
            Resolution::Reject(_)
        ));
    }

    #[test]
    fn test_equal_timestamp_concurrent_tie_breaks_on_counter_sum() {
        let resolver = Resolver::new(false, WINDOW);
        let current = product(10, 2_000, clock(&[("dev-a", 2)]));

        let heavier = meta(Source::Sync, 2_000, clock(&[("dev-b", 3)]));
        assert_eq!(resolver.resolve(&current, &heavier), Resolution::Accept);

        let lighter = meta(Source::Sync, 2_000, clock(&[("dev-b", 1)]));
        assert!(matches!(
            resolver.resolve(&current, &lighter),
            Resolution::Reject(_)
        ));
    }

    #[test]
    fn test_resolver_is_deterministic() {
        let resolver = Resolver::new(false, WINDOW);
        let current = product(12, 2_000, clock(&[("dev-a", 5)]));
        let incoming = meta(Source::Sync, 3_000, clock(&[("dev-b", 3)]));
        let patch = json!({"stock": 8});
        let first = resolver.resolve_product(&current, &patch, &incoming);
        for _ in 0..10 {
            assert_eq!(
                resolver.resolve_product(&current, &patch, &incoming),
                first
            );
        }
    }

    #[test]
    fn test_older_non_server_rejected() {
        let resolver = Resolver::new(false, WINDOW);
        let current = player(0, 2_000 + WINDOW + 10);
        let incoming = meta(Source::Sync, 1_000, clock(&[("dev-b", 9)]));
        assert!(matches!(
            resolver.resolve(&current, &incoming),
            Resolution::Reject(_)
        ));
    }
}
