use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Batch, Collection, Document, Filter, Store, WriteOp, merge_fields, new_document_id};
use crate::error::{Error, Result};
use crate::sanitize::Fields;
use crate::watch::{CHANGE_FEED_CAPACITY, Subscription, spawn_feed};

/// Documents of one collection, in insertion order.
type Table = Vec<(String, Fields)>;

/// In-process store. Cloning shares the same data.
///
/// Supports failure injection so callers can observe how operators behave
/// when commits fail or the store goes away.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    changes: broadcast::Sender<Collection>,
}

#[derive(Default)]
struct State {
    tables: HashMap<Collection, Table>,
    failing_commits: usize,
    offline: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
            }),
        }
    }

    /// Make the next `n` batch commits fail with [`Error::Transaction`].
    pub fn fail_next_commits(&self, n: usize) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.failing_commits = n;
        }
    }

    /// While offline every call fails with [`Error::StoreUnavailable`].
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.offline = offline;
        }
    }

    /// Number of documents in a collection, regardless of owner.
    pub fn count(&self, collection: Collection) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.tables.get(&collection).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        let state = self
            .inner
            .state
            .lock()
            .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".into()))?;
        if state.offline {
            return Err(Error::StoreUnavailable("memory store is offline".into()));
        }
        Ok(state)
    }

    fn notify(&self, collection: Collection) {
        // No receivers is fine.
        let _ = self.inner.changes.send(collection);
    }
}

fn position(table: &Table, id: &str) -> Option<usize> {
    table.iter().position(|(doc_id, _)| doc_id == id)
}

/// Apply one op to the staged tables.
fn apply(tables: &mut HashMap<Collection, Table>, op: WriteOp, assigned: &mut Vec<String>) -> Result<()> {
    match op {
        WriteOp::Insert { collection, fields } => {
            let id = new_document_id();
            tables.entry(collection).or_default().push((id.clone(), fields));
            assigned.push(id);
        }
        WriteOp::Update {
            collection,
            id,
            fields,
        } => {
            let table = tables.entry(collection).or_default();
            let idx = position(table, &id)
                .ok_or_else(|| Error::Transaction(format!("update target {collection}/{id} does not exist")))?;
            merge_fields(&mut table[idx].1, fields);
        }
        WriteOp::Delete { collection, id } => {
            if let Some(table) = tables.get_mut(&collection) {
                table.retain(|(doc_id, _)| *doc_id != id);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert(&self, collection: Collection, fields: Fields) -> Result<String> {
        let id = new_document_id();
        self.lock()?
            .tables
            .entry(collection)
            .or_default()
            .push((id.clone(), fields));
        self.notify(collection);
        Ok(id)
    }

    async fn update(&self, collection: Collection, id: &str, fields: Fields) -> Result<()> {
        {
            let mut state = self.lock()?;
            let table = state.tables.entry(collection).or_default();
            let idx = position(table, id).ok_or_else(|| Error::not_found(collection, id))?;
            merge_fields(&mut table[idx].1, fields);
        }
        self.notify(collection);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        let removed = {
            let mut state = self.lock()?;
            match state.tables.get_mut(&collection) {
                Some(table) => {
                    let before = table.len();
                    table.retain(|(doc_id, _)| doc_id != id);
                    table.len() != before
                }
                None => false,
            }
        };
        if removed {
            self.notify(collection);
        }
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        let state = self.lock()?;
        Ok(state.tables.get(&collection).and_then(|table| {
            table
                .iter()
                .find(|(doc_id, _)| doc_id == id)
                .map(|(doc_id, fields)| Document::new(doc_id.clone(), fields.clone()))
        }))
    }

    async fn query(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>> {
        let state = self.lock()?;
        Ok(state
            .tables
            .get(&collection)
            .map(|table| {
                table
                    .iter()
                    .filter(|(_, fields)| filter.matches(fields))
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(&self, batch: Batch) -> Result<Vec<String>> {
        let touched = batch.collections();
        let op_count = batch.len();
        let assigned = {
            let mut state = self.lock()?;
            if state.failing_commits > 0 {
                state.failing_commits -= 1;
                return Err(Error::Transaction("injected commit failure".into()));
            }

            let mut staged = state.tables.clone();
            let mut assigned = Vec::new();
            for op in batch.into_ops() {
                apply(&mut staged, op, &mut assigned)?;
            }
            state.tables = staged;
            assigned
        };
        debug!(ops = op_count, "memory batch committed");
        for collection in touched {
            self.notify(collection);
        }
        Ok(assigned)
    }

    fn subscribe(&self, collection: Collection, filter: Filter) -> Subscription {
        let changes = self.inner.changes.subscribe();
        spawn_feed(self.clone(), collection, filter, changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::{Value, json};

    fn body(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn insert_get_update_delete() {
        let store = MemoryStore::new();
        let id = store
            .insert(Collection::Companies, body(json!({ "name": "Acme" })))
            .await
            .unwrap();

        store
            .update(Collection::Companies, &id, body(json!({ "url": "https://acme.test" })))
            .await
            .unwrap();
        let doc = store.get(Collection::Companies, &id).await.unwrap().unwrap();
        assert_eq!(doc.get("name"), Some(&json!("Acme")));
        assert_eq!(doc.get("url"), Some(&json!("https://acme.test")));

        store.delete(Collection::Companies, &id).await.unwrap();
        store.delete(Collection::Companies, &id).await.unwrap();
        assert!(store.get(Collection::Companies, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_absent_document_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update(Collection::Tasks, "nope", body(json!({ "note": "x" })))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn query_keeps_insertion_order() {
        let store = MemoryStore::new();
        for name in ["b", "a", "c"] {
            store
                .insert(Collection::Companies, body(json!({ "name": name, "userId": "u1" })))
                .await
                .unwrap();
        }
        let names: Vec<Value> = store
            .query(Collection::Companies, &Filter::eq("userId", "u1"))
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.fields["name"].clone())
            .collect();
        assert_eq!(names, vec![json!("b"), json!("a"), json!("c")]);
    }

    #[tokio::test]
    async fn failed_batch_changes_nothing() {
        let store = MemoryStore::new();
        let keep = store
            .insert(Collection::Tasks, body(json!({ "note": "keep" })))
            .await
            .unwrap();

        let mut batch = Batch::new();
        batch
            .delete(Collection::Tasks, keep.clone())
            .insert(Collection::Tasks, body(json!({ "note": "new" })))
            .update(Collection::Tasks, "missing", body(json!({ "note": "x" })));
        let err = store.commit(batch).await.unwrap_err();

        assert!(matches!(err, Error::Transaction(_)));
        assert_eq!(store.count(Collection::Tasks), 1);
        assert!(store.get(Collection::Tasks, &keep).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        let mut batch = Batch::new();
        batch.insert(Collection::Tasks, body(json!({ "note": "a" })));

        assert!(store.commit(batch.clone()).await.is_err());
        let ids = store.commit(batch).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.count(Collection::Tasks), 1);
    }

    #[tokio::test]
    async fn offline_store_is_unavailable() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = store.query(Collection::Tasks, &Filter::all()).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        store.set_offline(false);
        assert!(store.query(Collection::Tasks, &Filter::all()).await.is_ok());
    }

    #[tokio::test]
    async fn subscription_delivers_full_snapshots() {
        let store = MemoryStore::new();
        store
            .insert(Collection::Tasks, body(json!({ "userId": "u1", "note": "first" })))
            .await
            .unwrap();

        let mut sub = store.subscribe(Collection::Tasks, Filter::eq("userId", "u1"));
        assert_eq!(sub.next().await.unwrap().len(), 1);

        store
            .insert(Collection::Tasks, body(json!({ "userId": "u2", "note": "other owner" })))
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().len(), 1);

        store
            .insert(Collection::Tasks, body(json!({ "userId": "u1", "note": "second" })))
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().len(), 2);
        sub.detach();
    }

    #[tokio::test]
    async fn other_collections_do_not_wake_subscribers() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(Collection::Tasks, Filter::all());
        assert!(sub.next_snapshot().await.unwrap().is_empty());

        store
            .insert(Collection::Companies, body(json!({ "name": "Acme" })))
            .await
            .unwrap();
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.next_snapshot()).await;
        assert!(pending.is_err());
    }
}
