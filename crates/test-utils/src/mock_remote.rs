use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tillsync_api::{RemoteBatch, RemoteDoc, RemoteError, RemoteStore, RemoteWrite};
use tillsync_types::{Collection, OpId};

type Docs = BTreeMap<String, Value>;

#[derive(Default)]
struct RemoteState {
    /// org -> collection -> doc id -> document.
    collections: HashMap<String, HashMap<Collection, Docs>>,
    /// org -> (collection, parent id, subcollection) -> delta id -> payload.
    subcollections: HashMap<String, HashMap<(Collection, String, String), Docs>>,
    /// org -> applied operation ids.
    applied: HashMap<String, HashSet<OpId>>,
    commits: u64,
}

/// An in-memory stand-in for the remote document store.
///
/// Batches apply atomically: a scripted failure rejects the whole batch
/// before any write lands. The mock stamps `updatedAt` on `Set`/`Merge`
/// writes with its own advancing server clock, mirroring server-assigned
/// timestamps.
pub struct MockRemote {
    state: Mutex<RemoteState>,
    /// Errors to return from upcoming calls, front first.
    fail_script: Mutex<VecDeque<RemoteError>>,
    server_now_ms: Mutex<i64>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState::default()),
            fail_script: Mutex::new(VecDeque::new()),
            server_now_ms: Mutex::new(1_700_000_000_000),
        }
    }

    /// Queues `error` to be returned from the next `count` store calls.
    pub fn fail_next(&self, error: RemoteError, count: usize) {
        if let Ok(mut script) = self.fail_script.lock() {
            for _ in 0..count {
                script.push_back(error.clone());
            }
        }
    }

    pub fn set_server_time(&self, ms: i64) {
        if let Ok(mut now) = self.server_now_ms.lock() {
            *now = ms;
        }
    }

    /// Direct document lookup for assertions.
    pub fn doc(&self, org_id: &str, collection: Collection, id: &str) -> Option<Value> {
        let state = self.state.lock().ok()?;
        state
            .collections
            .get(org_id)?
            .get(&collection)?
            .get(id)
            .cloned()
    }

    /// Removes a document out-of-band, simulating another client's delete.
    pub fn remove_doc(&self, org_id: &str, collection: Collection, id: &str) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(org) = state.collections.get_mut(org_id) {
                if let Some(docs) = org.get_mut(&collection) {
                    docs.remove(id);
                }
            }
        }
    }

    /// Inserts a document out-of-band, simulating another client's write.
    pub fn seed_doc(&self, org_id: &str, collection: Collection, id: &str, data: Value) {
        if let Ok(mut state) = self.state.lock() {
            state
                .collections
                .entry(org_id.to_string())
                .or_default()
                .entry(collection)
                .or_default()
                .insert(id.to_string(), data);
        }
    }

    pub fn applied_count(&self, org_id: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.applied.get(org_id).map(|a| a.len()))
            .unwrap_or(0)
    }

    pub fn commit_count(&self) -> u64 {
        self.state.lock().map(|s| s.commits).unwrap_or(0)
    }

    pub fn delta_count(
        &self,
        org_id: &str,
        collection: Collection,
        parent_id: &str,
        subcollection: &str,
    ) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| {
                s.subcollections.get(org_id).and_then(|subs| {
                    subs.get(&(
                        collection,
                        parent_id.to_string(),
                        subcollection.to_string(),
                    ))
                    .map(|d| d.len())
                })
            })
            .unwrap_or(0)
    }

    fn take_scripted_failure(&self) -> Option<RemoteError> {
        self.fail_script.lock().ok()?.pop_front()
    }

    fn now(&self) -> i64 {
        let mut now = match self.server_now_ms.lock() {
            Ok(g) => g,
            Err(_) => return 0,
        };
        // Strictly advancing so consecutive commits get distinct stamps.
        *now += 1;
        *now
    }
}

fn merge_into(doc: &mut Value, patch: &Value) {
    if let (Some(base), Some(updates)) = (doc.as_object_mut(), patch.as_object()) {
        for (key, value) in updates {
            base.insert(key.clone(), value.clone());
        }
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn snapshot(
        &self,
        org_id: &str,
        collection: Collection,
    ) -> Result<Vec<RemoteDoc>, RemoteError> {
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        let state = self
            .state
            .lock()
            .map_err(|_| RemoteError::Other("mock lock poisoned".into()))?;
        Ok(state
            .collections
            .get(org_id)
            .and_then(|org| org.get(&collection))
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| RemoteDoc {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn exists(
        &self,
        org_id: &str,
        collection: Collection,
        id: &str,
    ) -> Result<bool, RemoteError> {
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        let state = self
            .state
            .lock()
            .map_err(|_| RemoteError::Other("mock lock poisoned".into()))?;
        Ok(state
            .collections
            .get(org_id)
            .and_then(|org| org.get(&collection))
            .map(|docs| docs.contains_key(id))
            .unwrap_or(false))
    }

    async fn applied_ops(
        &self,
        org_id: &str,
        op_ids: &[OpId],
    ) -> Result<HashSet<OpId>, RemoteError> {
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        let state = self
            .state
            .lock()
            .map_err(|_| RemoteError::Other("mock lock poisoned".into()))?;
        let applied = match state.applied.get(org_id) {
            Some(a) => a,
            None => return Ok(HashSet::new()),
        };
        Ok(op_ids
            .iter()
            .filter(|id| applied.contains(*id))
            .cloned()
            .collect())
    }

    async fn commit(&self, org_id: &str, batch: RemoteBatch) -> Result<(), RemoteError> {
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }
        let stamp = self.now();
        let mut state = self
            .state
            .lock()
            .map_err(|_| RemoteError::Other("mock lock poisoned".into()))?;
        state.commits += 1;

        for write in batch.writes {
            match write {
                RemoteWrite::Set {
                    collection,
                    id,
                    mut data,
                } => {
                    merge_into(&mut data, &serde_json::json!({"updatedAt": stamp}));
                    state
                        .collections
                        .entry(org_id.to_string())
                        .or_default()
                        .entry(collection)
                        .or_default()
                        .insert(id, data);
                }
                RemoteWrite::Merge {
                    collection,
                    id,
                    data,
                } => {
                    let docs = state
                        .collections
                        .entry(org_id.to_string())
                        .or_default()
                        .entry(collection)
                        .or_default();
                    let doc = docs.entry(id).or_insert_with(|| serde_json::json!({}));
                    merge_into(doc, &data);
                    merge_into(doc, &serde_json::json!({"updatedAt": stamp}));
                }
                RemoteWrite::Increment {
                    collection,
                    id,
                    field,
                    delta,
                } => {
                    let docs = state
                        .collections
                        .entry(org_id.to_string())
                        .or_default()
                        .entry(collection)
                        .or_default();
                    let doc = docs.entry(id).or_insert_with(|| serde_json::json!({}));
                    let current = doc.get(&field).and_then(Value::as_i64).unwrap_or(0);
                    if let Some(object) = doc.as_object_mut() {
                        object.insert(field, Value::from(current + delta));
                        object.insert("updatedAt".into(), Value::from(stamp));
                    }
                }
                RemoteWrite::Delete { collection, id } => {
                    if let Some(org) = state.collections.get_mut(org_id) {
                        if let Some(docs) = org.get_mut(&collection) {
                            docs.remove(&id);
                        }
                    }
                }
                RemoteWrite::AppendDelta {
                    collection,
                    parent_id,
                    subcollection,
                    id,
                    data,
                } => {
                    state
                        .subcollections
                        .entry(org_id.to_string())
                        .or_default()
                        .entry((collection, parent_id, subcollection))
                        .or_default()
                        .insert(id, data);
                }
                RemoteWrite::MarkApplied { op_id } => {
                    state
                        .applied
                        .entry(org_id.to_string())
                        .or_default()
                        .insert(op_id);
                }
            }
        }
        Ok(())
    }
}
