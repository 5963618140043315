//! Shared harness: an engine wired to in-memory mocks with all background
//! timers disabled, driven by hand.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tillsync_engine::{EngineConfig, SyncEngine};
use tillsync_test_utils::{ManualNetwork, MemoryKv, MockRemote};

pub const ORG: &str = "org-1";
pub const USER: &str = "user-1";

pub struct Harness {
    pub engine: SyncEngine,
    pub kv: Arc<MemoryKv>,
    pub remote: Arc<MockRemote>,
    pub network: Arc<ManualNetwork>,
}

pub async fn harness(online: bool) -> Harness {
    harness_with(online, test_config()).await
}

pub async fn harness_with(online: bool, config: EngineConfig) -> Harness {
    let kv = Arc::new(MemoryKv::new());
    let remote = Arc::new(MockRemote::new());
    let network = Arc::new(ManualNetwork::new(online));
    let engine = SyncEngine::new(config, kv.clone(), remote.clone(), network.clone())
        .await
        .unwrap();
    engine.set_organization(ORG, USER).await.unwrap();
    Harness {
        engine,
        kv,
        remote,
        network,
    }
}

/// Second device against the same remote, with its own local store.
pub async fn peer_harness(remote: Arc<MockRemote>, online: bool) -> Harness {
    let kv = Arc::new(MemoryKv::new());
    let network = Arc::new(ManualNetwork::new(online));
    let engine = SyncEngine::new(test_config(), kv.clone(), remote.clone(), network.clone())
        .await
        .unwrap();
    engine.set_organization(ORG, USER).await.unwrap();
    Harness {
        engine,
        kv,
        remote,
        network,
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        // Zero backoff so retry sequences run without waiting.
        real_backoff_base: Duration::ZERO,
        real_backoff_cap: Duration::ZERO,
        network_backoff_base: Duration::ZERO,
        network_backoff_cap: Duration::ZERO,
        ..EngineConfig::manual()
    }
}

/// Drains until the queue and pending bundles are empty, tolerating the
/// reconnect listener racing for the sync lock.
pub async fn drain_until_idle(engine: &SyncEngine) {
    for _ in 0..50 {
        let _ = engine.drain_now().await;
        let status = engine.status().await;
        if status.main_queue_length == 0 && status.pending_bundles == 0 && !status.is_syncing {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("engine did not go idle");
}
