//! Outbox discipline end to end: orphan filtering, the two retry budgets,
//! dead-letter resurrection, and status reporting.

mod common;

use common::{drain_until_idle, harness, ORG, USER};
use serde_json::json;
use std::sync::Arc;
use tillsync_api::{KvStore, RemoteError};
use tillsync_engine::{DrainOutcome, NewProduct, SyncEngine};
use tillsync_test_utils::{ManualNetwork, MemoryKv, MockRemote};
use tillsync_types::{keys, Collection};

#[tokio::test]
async fn test_orphaned_outbox_item_is_filtered_without_remote_calls() {
    // A stale update for an entity that no longer exists locally, planted
    // straight into the durable queue blob.
    let kv = Arc::new(MemoryKv::new());
    let stale = json!([{
        "id": "op-stale",
        "action": "update",
        "collection": "products",
        "entityId": "p-gone",
        "data": {"name": "Ghost"},
        "timestamp": 1_000,
        "nextAttemptAt": 0,
        "retryCount": 0,
        "networkRetryCount": 0
    }]);
    kv.put(keys::SYNC_QUEUE, &serde_json::to_vec(&stale).unwrap())
        .await
        .unwrap();

    let remote = Arc::new(MockRemote::new());
    let network = Arc::new(ManualNetwork::new(true));
    let engine = SyncEngine::new(common::test_config(), kv, remote.clone(), network)
        .await
        .unwrap();
    engine.set_organization(ORG, USER).await.unwrap();

    // Filtered at load: gone from the queue, never dead-lettered, and the
    // drain issues no remote calls for it.
    let status = engine.status().await;
    assert_eq!(status.main_queue_length, 0);
    assert_eq!(status.dead_letter_queue_length, 0);

    let _ = engine.drain_now().await.unwrap();
    assert_eq!(remote.commit_count(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_network_failures_do_not_exhaust_the_item() {
    let h = harness(true).await;

    // Every remote call times out for the next ten attempts. The script is
    // armed before the write so the opportunistic push is attempt one.
    h.remote.fail_next(RemoteError::Timeout("simulated".into()), 10);
    h.engine
        .create_product(NewProduct {
            name: "Water".into(),
            category: String::new(),
            price: 2,
            stock: 10,
        })
        .await
        .unwrap();
    for _ in 0..9 {
        let _ = h.engine.drain_now().await.unwrap();
    }

    // Still in the main queue: the budget is 15 and network failures never
    // dead-letter.
    let status = h.engine.status().await;
    assert_eq!(status.main_queue_length, 1);
    assert_eq!(status.dead_letter_queue_length, 0);

    // Once the weather clears, the very next attempt lands.
    drain_until_idle(&h.engine).await;
    assert_eq!(h.engine.status().await.main_queue_length, 0);
    assert_eq!(h.remote.commit_count(), 1);
}

#[tokio::test]
async fn test_real_failures_dead_letter_and_reconnect_resurrects() {
    let h = harness(true).await;

    // Three real failures exhaust the budget. Armed before the write so the
    // opportunistic push is attempt one.
    h.remote
        .fail_next(RemoteError::Invalid("schema mismatch".into()), 3);
    h.engine
        .create_product(NewProduct {
            name: "Water".into(),
            category: String::new(),
            price: 2,
            stock: 10,
        })
        .await
        .unwrap();
    for _ in 0..2 {
        let _ = h.engine.drain_now().await.unwrap();
    }
    let status = h.engine.status().await;
    assert_eq!(status.main_queue_length, 0);
    assert_eq!(status.dead_letter_queue_length, 1);

    // The reconnect edge resurrects everything and drains it through.
    h.network.set_online(false);
    h.network.set_online(true);
    for _ in 0..50 {
        if h.engine.status().await.dead_letter_queue_length == 0
            && h.engine.status().await.main_queue_length == 0
        {
            break;
        }
        let _ = h.engine.drain_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let status = h.engine.status().await;
    assert_eq!(status.dead_letter_queue_length, 0);
    assert_eq!(status.main_queue_length, 0);
}

#[tokio::test]
async fn test_drain_reports_offline_and_empty_completion() {
    let h = harness(false).await;
    assert_eq!(h.engine.drain_now().await.unwrap(), DrainOutcome::Offline);

    h.network.set_online(true);
    match h.engine.drain_now().await.unwrap() {
        DrainOutcome::Completed {
            bundles_applied,
            items_processed,
            ..
        } => {
            assert_eq!(bundles_applied, 0);
            assert_eq!(items_processed, 0);
        }
        other => panic!("expected completed drain, got {other:?}"),
    }
}

#[tokio::test]
async fn test_status_tracks_pending_work() {
    let h = harness(false).await;
    let status = h.engine.status().await;
    assert!(!status.is_online);
    assert_eq!(status.main_queue_length, 0);
    assert_eq!(status.oldest_operation_age_ms, None);

    h.engine
        .create_product(NewProduct {
            name: "Water".into(),
            category: String::new(),
            price: 2,
            stock: 10,
        })
        .await
        .unwrap();

    let status = h.engine.status().await;
    assert_eq!(status.main_queue_length, 1);
    assert!(status.oldest_operation_age_ms.is_some());

    h.network.set_online(true);
    drain_until_idle(&h.engine).await;
    let status = h.engine.status().await;
    assert_eq!(status.main_queue_length, 0);
    assert_eq!(status.oldest_operation_age_ms, None);
}

#[tokio::test]
async fn test_offline_create_then_update_lands_in_order() {
    let h = harness(false).await;
    let product = h
        .engine
        .create_product(NewProduct {
            name: "Water".into(),
            category: String::new(),
            price: 2,
            stock: 10,
        })
        .await
        .unwrap();
    h.engine
        .update_entity(
            Collection::Products,
            &product.id,
            json!({"name": "Sparkling"}),
        )
        .await
        .unwrap();

    h.network.set_online(true);
    drain_until_idle(&h.engine).await;

    let doc = h.remote.doc(ORG, Collection::Products, &product.id).unwrap();
    assert_eq!(doc.get("name").and_then(|v| v.as_str()), Some("Sparkling"));
    assert_eq!(doc.get("stock").and_then(|v| v.as_i64()), Some(10));
}

#[tokio::test]
async fn test_sale_of_offline_created_entities_upserts_dependencies_first() {
    // Everything — product, player, sale — happens before the remote has
    // seen any of it. The bundle goes first during the drain and upserts
    // its dependencies; the create items then find their documents already
    // present and must not roll the incremented stock back.
    let h = harness(false).await;
    let product = h
        .engine
        .create_product(NewProduct {
            name: "Water".into(),
            category: String::new(),
            price: 2,
            stock: 10,
        })
        .await
        .unwrap();
    let player = h
        .engine
        .create_player(tillsync_engine::NewPlayer {
            first_name: "Alex".into(),
            last_name: "Mason".into(),
        })
        .await
        .unwrap();
    h.engine
        .create_assignment_sale(tillsync_engine::SaleRequest {
            product_id: product.id.clone(),
            player_id: player.id.clone(),
            quantity: 3,
        })
        .await
        .unwrap();

    h.network.set_online(true);
    drain_until_idle(&h.engine).await;

    let doc = h.remote.doc(ORG, Collection::Products, &product.id).unwrap();
    assert_eq!(doc.get("stock").and_then(|v| v.as_i64()), Some(7));
    let doc = h.remote.doc(ORG, Collection::Players, &player.id).unwrap();
    assert_eq!(doc.get("balance").and_then(|v| v.as_i64()), Some(6));

    let products = h.engine.products_with_overlay().await.unwrap();
    assert_eq!(products[0].row.stock, 7);
    assert!(!products[0].provisional);
}

#[tokio::test]
async fn test_balance_adjustment_visible_via_overlay_then_committed() {
    let h = harness(true).await;
    let player = h
        .engine
        .create_player(tillsync_engine::NewPlayer {
            first_name: "Alex".into(),
            last_name: "Mason".into(),
        })
        .await
        .unwrap();
    drain_until_idle(&h.engine).await;

    h.network.set_online(false);
    h.engine.adjust_player_balance(&player.id, 10).await.unwrap();

    // Overlay shows it immediately; the base cache moves only on commit.
    let players = h.engine.players_with_overlay().await.unwrap();
    assert_eq!(players[0].row.balance, 10);
    assert!(players[0].provisional);

    h.network.set_online(true);
    drain_until_idle(&h.engine).await;

    let players = h.engine.players_with_overlay().await.unwrap();
    assert_eq!(players[0].row.balance, 10);
    assert!(!players[0].provisional);

    // One delta appended at the remote, never a blind overwrite.
    assert_eq!(
        h.remote.delta_count(ORG, Collection::Players, &player.id, "balanceDeltas"),
        1
    );
}
