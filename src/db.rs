use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::fields;
use crate::sanitize::Fields;
use crate::store::{Batch, Collection, Document, Filter, Store, WriteOp, merge_fields, new_document_id};
use crate::watch::{CHANGE_FEED_CAPACITY, Subscription, spawn_feed};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL CHECK (collection IN ('companies', 'tasks', 'commonTexts')),
    id         TEXT NOT NULL,
    body       TEXT NOT NULL CHECK (json_valid(body)),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_owner
    ON documents(collection, json_extract(body, '$.userId'));
"#;

const COLLECTION_QUERY: &str =
    "SELECT id, body FROM documents WHERE collection = ?1 ORDER BY rowid";

const OWNER_QUERY: &str = "SELECT id, body FROM documents
     WHERE collection = ?1 AND json_extract(body, '$.userId') = ?2
     ORDER BY rowid";

/// SQLite-backed document store. Cloning shares the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    changes: broadcast::Sender<Collection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::StoreUnavailable(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, path.to_path_buf())
    }

    /// Fresh, initialized store that lives only as long as this handle.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self::with_connection(Connection::open_in_memory()?, PathBuf::from(":memory:"))?;
        store.init()?;
        Ok(store)
    }

    fn with_connection(conn: Connection, path: PathBuf) -> Result<Self> {
        set_pragmas(&conn)?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            changes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn init(&self) -> Result<()> {
        self.lock()?.execute_batch(SCHEMA)?;
        info!(path = %self.path.display(), "schema initialized");
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='documents'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(Error::StoreUnavailable(
                "database not initialized. Run 'jobtrail init' first.".into(),
            ));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StoreUnavailable("connection lock poisoned".into()))
    }

    fn notify(&self, collection: Collection) {
        let _ = self.changes.send(collection);
    }
}

fn set_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn encode(fields: &Fields) -> Result<String> {
    serde_json::to_string(fields).map_err(|e| Error::Validation(e.to_string()))
}

fn decode(collection: Collection, id: String, body: &str) -> Result<Document> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(fields)) => Ok(Document::new(id, fields)),
        Ok(_) => Err(Error::StoreUnavailable(format!(
            "{collection}/{id} body is not a JSON object"
        ))),
        Err(source) => Err(Error::Decode {
            collection,
            id,
            source,
        }),
    }
}

fn load(conn: &Connection, collection: Collection, id: &str) -> Result<Option<Document>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection.as_str(), id],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|b| decode(collection, id.to_string(), &b)).transpose()
}

fn insert_row(conn: &Connection, collection: Collection, fields: &Fields) -> Result<String> {
    let id = new_document_id();
    conn.execute(
        "INSERT INTO documents (collection, id, body) VALUES (?1, ?2, ?3)",
        params![collection.as_str(), id, encode(fields)?],
    )?;
    Ok(id)
}

/// Merge into an existing row. `Ok(false)` when the row is absent.
fn update_row(conn: &Connection, collection: Collection, id: &str, patch: Fields) -> Result<bool> {
    let Some(mut doc) = load(conn, collection, id)? else {
        return Ok(false);
    };
    merge_fields(&mut doc.fields, patch);
    conn.execute(
        "UPDATE documents SET body = ?1, updated_at = datetime('now')
         WHERE collection = ?2 AND id = ?3",
        params![encode(&doc.fields)?, collection.as_str(), id],
    )?;
    Ok(true)
}

fn delete_row(conn: &Connection, collection: Collection, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
        params![collection.as_str(), id],
    )?;
    Ok(changed > 0)
}

fn apply(tx: &Transaction<'_>, op: WriteOp, assigned: &mut Vec<String>) -> Result<()> {
    match op {
        WriteOp::Insert { collection, fields } => {
            assigned.push(insert_row(tx, collection, &fields)?);
        }
        WriteOp::Update {
            collection,
            id,
            fields,
        } => {
            if !update_row(tx, collection, &id, fields)? {
                return Err(Error::Transaction(format!(
                    "update target {collection}/{id} does not exist"
                )));
            }
        }
        WriteOp::Delete { collection, id } => {
            delete_row(tx, collection, &id)?;
        }
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert(&self, collection: Collection, fields: Fields) -> Result<String> {
        let conn = self.lock()?;
        let id = insert_row(&conn, collection, &fields)?;
        drop(conn);
        self.notify(collection);
        Ok(id)
    }

    async fn update(&self, collection: Collection, id: &str, fields: Fields) -> Result<()> {
        let conn = self.lock()?;
        if !update_row(&conn, collection, id, fields)? {
            return Err(Error::not_found(collection, id));
        }
        drop(conn);
        self.notify(collection);
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        let conn = self.lock()?;
        let removed = delete_row(&conn, collection, id)?;
        drop(conn);
        if removed {
            self.notify(collection);
        }
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        let conn = self.lock()?;
        load(&conn, collection, id)
    }

    async fn query(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>> {
        let conn = self.lock()?;
        let rows: Vec<(String, String)> = match filter.value_of(fields::USER_ID) {
            // Owner-scoped reads go through idx_documents_owner.
            Some(Value::String(owner)) => {
                let mut stmt = conn.prepare_cached(OWNER_QUERY)?;
                let rows = stmt
                    .query_map(params![collection.as_str(), owner], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            _ => {
                let mut stmt = conn.prepare_cached(COLLECTION_QUERY)?;
                let rows = stmt
                    .query_map(params![collection.as_str()], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        let mut docs = Vec::new();
        for (id, body) in rows {
            let doc = decode(collection, id, &body)?;
            if filter.matches(&doc.fields) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn commit(&self, batch: Batch) -> Result<Vec<String>> {
        let touched = batch.collections();
        let op_count = batch.len();
        let assigned = {
            let mut conn = self.lock()?;
            let tx = conn
                .transaction()
                .map_err(|e| Error::Transaction(e.to_string()))?;
            let mut assigned = Vec::new();
            for op in batch.into_ops() {
                // Dropping `tx` on error rolls everything back.
                apply(&tx, op, &mut assigned).map_err(|e| match e {
                    err @ Error::Transaction(_) => err,
                    other => Error::Transaction(other.to_string()),
                })?;
            }
            tx.commit().map_err(|e| Error::Transaction(e.to_string()))?;
            assigned
        };
        debug!(ops = op_count, "sqlite batch committed");
        for collection in touched {
            self.notify(collection);
        }
        Ok(assigned)
    }

    fn subscribe(&self, collection: Collection, filter: Filter) -> Subscription {
        let changes = self.changes.subscribe();
        spawn_feed(self.clone(), collection, filter, changes)
    }
}
