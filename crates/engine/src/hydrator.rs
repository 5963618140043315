//! Bidirectional hydration: pulls remote snapshots, feeds them through the
//! single write path as server-sourced operations, and detects remote
//! deletions.

use crate::clock::DeviceClock;
use crate::engine::EngineShared;
use std::collections::HashSet;
use std::sync::Arc;
use tillsync_api::RemoteDoc;
use tillsync_types::error::EngineError;
use tillsync_types::time::{normalize_timestamp, now_ms};
use tillsync_types::{
    Collection, EntityId, Operation, OperationKind, OperationMeta, Source, VectorClock,
};
use tokio::sync::Mutex;

/// Pulls every collection. `authoritative` engages force-server mode for
/// the duration of the pull — the post-login path where the remote snapshot
/// must win over whatever the cache holds.
pub(crate) async fn hydrate_all(
    shared: &Arc<Mutex<EngineShared>>,
    authoritative: bool,
) -> Result<(), EngineError> {
    for collection in Collection::all() {
        hydrate_collection(shared, collection, authoritative).await?;
    }
    let mut guard = shared.lock().await;
    guard.last_full_hydration = now_ms();
    Ok(())
}

pub(crate) async fn hydrate_collection(
    shared: &Arc<Mutex<EngineShared>>,
    collection: Collection,
    authoritative: bool,
) -> Result<(), EngineError> {
    let (org_id, user_key, remote) = {
        let guard = shared.lock().await;
        let context = guard.context.clone().ok_or(EngineError::NoOrganization)?;
        (context.org_id, context.user_key, guard.remote.clone())
    };

    // Snapshot outside the state lock; a slow remote must not block reads.
    let docs = match remote.snapshot(&org_id, collection).await {
        Ok(docs) => docs,
        Err(error) => {
            tracing::debug!(
                target: "hydrator",
                collection = %collection,
                error = %error,
                "snapshot failed, skipping hydration pass"
            );
            return Ok(());
        }
    };

    let now = now_ms();
    let mut guard = shared.lock().await;

    if authoritative {
        guard.force_server = true;
    }

    let local_ids = guard.cache.ids(collection).await?;
    let mut remote_ids: HashSet<EntityId> = HashSet::with_capacity(docs.len());

    let result = apply_snapshot(
        &mut guard,
        collection,
        docs,
        &local_ids,
        &mut remote_ids,
        now,
    )
    .await;

    guard.force_server = false;
    result?;

    // Remote deletions: anything we hold that the snapshot no longer
    // contains, unless local uncommitted work still references it.
    let protected = guard.protected_entity_ids();
    let deleted: Vec<EntityId> = local_ids
        .difference(&remote_ids)
        .filter(|id| !protected.contains(*id))
        .cloned()
        .collect();
    for id in deleted {
        tracing::info!(target: "hydrator", collection = %collection, id = %id, "remote deletion observed");
        let op = Operation {
            id: DeviceClock::new_id(),
            kind: OperationKind::Delete,
            collection,
            entity_id: Some(id),
            data: serde_json::Value::Null,
            metadata: server_meta(now, VectorClock::new()),
        };
        guard.apply_op(op).await?;
    }

    guard.cache.set_last_sync(collection, now).await?;
    guard.cache.mark_initialized(collection, &user_key).await?;
    Ok(())
}

async fn apply_snapshot(
    guard: &mut EngineShared,
    collection: Collection,
    docs: Vec<RemoteDoc>,
    local_ids: &HashSet<EntityId>,
    remote_ids: &mut HashSet<EntityId>,
    now: i64,
) -> Result<(), EngineError> {
    for doc in docs {
        remote_ids.insert(doc.id.clone());

        let mut data = doc.data;
        let timestamp = sanitize_doc(&mut data, &doc.id, now);
        let vector_clock = doc_vector_clock(&data);

        let kind = if local_ids.contains(&doc.id) {
            OperationKind::Update
        } else {
            OperationKind::Create
        };

        let op = Operation {
            id: DeviceClock::new_id(),
            kind,
            collection,
            entity_id: Some(doc.id),
            data,
            metadata: OperationMeta {
                timestamp,
                ..server_meta(now, vector_clock)
            },
        };
        guard.apply_op(op).await?;
    }
    Ok(())
}

fn server_meta(now: i64, vector_clock: VectorClock) -> OperationMeta {
    OperationMeta {
        device_id: "server".into(),
        timestamp: now,
        version: 0,
        vector_clock,
        source: Source::Server,
    }
}

/// Normalises a remote document in place so it decodes into an entity:
/// timestamps become epoch milliseconds whatever shape they arrived in,
/// and the document key is mirrored into the `id` field. Returns the
/// normalised update timestamp.
fn sanitize_doc(data: &mut serde_json::Value, id: &str, now: i64) -> i64 {
    let updated_at = data
        .get("updatedAt")
        .map(|raw| normalize_timestamp(raw, now))
        .unwrap_or(now);

    if let Some(object) = data.as_object_mut() {
        object.insert("id".into(), serde_json::Value::String(id.to_string()));
        object.insert("updatedAt".into(), serde_json::Value::from(updated_at));

        for field in ["createdAt", "date", "lastPurchaseDate"] {
            if let Some(raw) = object.get(field) {
                if !raw.is_i64() && !raw.is_null() {
                    let normalised = normalize_timestamp(raw, now);
                    object.insert(field.into(), serde_json::Value::from(normalised));
                }
            }
        }
        if object.get("createdAt").is_none() {
            object.insert("createdAt".into(), serde_json::Value::from(updated_at));
        }
    }
    updated_at
}

/// Peer clocks ride inside the serialised version metadata when the writer
/// was another engine instance.
fn doc_vector_clock(data: &serde_json::Value) -> VectorClock {
    data.get("version")
        .and_then(|version| version.get("vectorClock"))
        .and_then(|clock| serde_json::from_value(clock.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_doc_normalises_timestamps() {
        let now = 1_700_000_000_000;
        let mut data = json!({
            "name": "Water",
            "updatedAt": {"seconds": 1_690_000_000u64, "nanoseconds": 0u32},
            "createdAt": "2023-07-22T05:06:40Z",
        });
        let ts = sanitize_doc(&mut data, "p1", now);
        assert_eq!(ts, 1_690_000_000_000);
        assert_eq!(data.get("updatedAt").and_then(|v| v.as_i64()), Some(ts));
        assert_eq!(data.get("id").and_then(|v| v.as_str()), Some("p1"));
        assert!(data.get("createdAt").and_then(|v| v.as_i64()).is_some());
    }

    #[test]
    fn test_sanitize_doc_defaults_missing_updated_at() {
        let now = 1_700_000_000_000;
        let mut data = json!({"name": "Water"});
        let ts = sanitize_doc(&mut data, "p1", now);
        assert_eq!(ts, now);
        assert_eq!(data.get("createdAt").and_then(|v| v.as_i64()), Some(now));
    }

    #[test]
    fn test_doc_vector_clock_extraction() {
        let data = json!({
            "version": {"vectorClock": {"dev-a": 3, "dev-b": 1}}
        });
        let clock = doc_vector_clock(&data);
        assert_eq!(clock.get("dev-a"), 3);
        assert_eq!(clock.get("dev-b"), 1);
        assert_eq!(doc_vector_clock(&json!({})), VectorClock::new());
    }
}
