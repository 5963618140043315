//! Durability across restarts, on the real redb-backed store: cache rows,
//! queued work, device identity, and the vector clock all survive.

mod common;

use common::{drain_until_idle, ORG, USER};
use std::sync::Arc;
use tillsync_engine::{NewProduct, SyncEngine};
use tillsync_storage::RedbKv;
use tillsync_test_utils::{ManualNetwork, MockRemote};
use tillsync_types::Collection;

#[tokio::test]
async fn test_offline_writes_survive_restart_and_then_sync() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tillsync.redb");
    let remote = Arc::new(MockRemote::new());

    let product_id = {
        let kv = Arc::new(RedbKv::open(&path).unwrap());
        let network = Arc::new(ManualNetwork::new(false));
        let engine = SyncEngine::new(common::test_config(), kv, remote.clone(), network)
            .await
            .unwrap();
        engine.set_organization(ORG, USER).await.unwrap();

        let product = engine
            .create_product(NewProduct {
                name: "Water".into(),
                category: String::new(),
                price: 2,
                stock: 10,
            })
            .await
            .unwrap();
        assert_eq!(engine.status().await.main_queue_length, 1);
        engine.shutdown().await;
        product.id
    };

    // Relaunch: the row and its queued create are still there, and the
    // first drain pushes it through.
    let kv = Arc::new(RedbKv::open(&path).unwrap());
    let network = Arc::new(ManualNetwork::new(true));
    let engine = SyncEngine::new(common::test_config(), kv, remote.clone(), network.clone())
        .await
        .unwrap();
    engine.set_organization(ORG, USER).await.unwrap();

    let products = engine.products_with_overlay().await.unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].row.id, product_id);

    let h = common::Harness {
        engine,
        kv: Arc::new(tillsync_test_utils::MemoryKv::new()),
        remote: remote.clone(),
        network,
    };
    drain_until_idle(&h.engine).await;
    assert!(h.remote.doc(ORG, Collection::Products, &product_id).is_some());
    h.engine.shutdown().await;
}
