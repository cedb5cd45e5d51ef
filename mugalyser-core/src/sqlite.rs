//! Durable document store on a SQLite file.
//!
//! Documents are rows of `(collection, body)` with the JSON body as text; the rowid keeps
//! insertion order. Sequences live in their own table and are bumped with a single
//! upsert, so separate processes sharing one file never hand out the same value.
//! Conditional updates run inside an `IMMEDIATE` transaction, which takes the write lock
//! before the document is checked.
//!
//! Pipelines are evaluated in-process by the interpreter in [`crate::store`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rusqlite::{params, Connection, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, info};

use crate::agg::Stage;
use crate::contract::{DocumentStream, DocumentStore, Record};
use crate::error::{Error, Result};
use crate::store::{matches, run_pipeline};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        collection TEXT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection, id);
    CREATE TABLE IF NOT EXISTS sequences (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file, creating missing parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(Error::storage)?;
        }
        let conn = Connection::open(path).map_err(Error::storage)?;
        conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA journal_mode=WAL;")
            .map_err(Error::storage)?;
        conn.execute_batch(SCHEMA).map_err(Error::storage)?;
        info!(path = %path.display(), "[STORE] Opened database");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .map_err(Error::storage)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("database mutex poisoned".into()))
    }
}

// Rows of one collection in insertion order, with their ids.
fn load(conn: &Connection, collection: &str) -> Result<Vec<(i64, Value)>> {
    let mut stmt = conn
        .prepare("SELECT id, body FROM documents WHERE collection = ?1 ORDER BY id")
        .map_err(Error::storage)?;
    let rows = stmt
        .query_map(params![collection], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(Error::storage)?;
    let mut docs = Vec::new();
    for row in rows {
        let (id, body) = row.map_err(Error::storage)?;
        docs.push((id, serde_json::from_str(&body).map_err(Error::storage)?));
    }
    Ok(docs)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_many(&self, collection: &str, docs: Vec<Record>) -> Result<()> {
        if docs.iter().any(|d| !d.is_object()) {
            return Err(Error::Storage(format!(
                "only objects can be stored in {collection}"
            )));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(Error::storage)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO documents (collection, body) VALUES (?1, ?2)")
                .map_err(Error::storage)?;
            for doc in &docs {
                let body = serde_json::to_string(doc).map_err(Error::storage)?;
                stmt.execute(params![collection, body])
                    .map_err(Error::storage)?;
            }
        }
        tx.commit().map_err(Error::storage)?;
        debug!(collection, count = docs.len(), "[STORE] Inserted documents");
        Ok(())
    }

    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<DocumentStream> {
        let docs = {
            let conn = self.lock()?;
            load(&conn, collection)?
        };
        let results = run_pipeline(docs.into_iter().map(|(_, doc)| doc).collect(), pipeline)?;
        debug!(
            collection,
            results = results.len(),
            "[STORE] Pipeline evaluated"
        );
        Ok(stream::iter(results.into_iter().map(Ok)).boxed())
    }

    async fn next_sequence(&self, name: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(
            "INSERT INTO sequences (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1
             RETURNING value",
            params![name],
            |row| row.get(0),
        )
        .map_err(Error::storage)
    }

    async fn update_one(&self, collection: &str, filter: &Value, set: Value) -> Result<u64> {
        let filter = filter
            .as_object()
            .ok_or_else(|| Error::Storage("update filter must be an object".into()))?;
        let Value::Object(set) = set else {
            return Err(Error::Storage("update document must be an object".into()));
        };

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(Error::storage)?;
        let mut target = None;
        for (id, doc) in load(&tx, collection)? {
            if matches(&doc, filter)? {
                target = Some((id, doc));
                break;
            }
        }
        let Some((id, mut doc)) = target else {
            return Ok(0);
        };
        if let Value::Object(fields) = &mut doc {
            for (k, v) in set {
                fields.insert(k, v);
            }
        }
        let body = serde_json::to_string(&doc).map_err(Error::storage)?;
        tx.execute(
            "UPDATE documents SET body = ?1 WHERE id = ?2",
            params![body, id],
        )
        .map_err(Error::storage)?;
        tx.commit().map_err(Error::storage)?;
        Ok(1)
    }

    /// Every write commits on its own.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
