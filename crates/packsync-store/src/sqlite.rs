// ABOUTME: SQLite-backed durable substrate; one table holds many logical stores keyed by (store, key).
// ABOUTME: Connection access runs on the blocking pool so async callers never stall the runtime.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::substrate::{Substrate, SubstrateError};

/// A logical store inside a SQLite database file. Several stores (packs,
/// outbox) can share one file and one connection via [`SqliteSubstrate::with_store`].
#[derive(Clone)]
pub struct SqliteSubstrate {
    conn: Arc<Mutex<Connection>>,
    store: String,
}

impl SqliteSubstrate {
    /// Open or create the database at `path` and address the logical store `store`.
    pub fn open(path: &Path, store: &str) -> Result<Self, SubstrateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SubstrateError::Task(format!("create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn, store)
    }

    /// Database that lives only as long as this value and its clones.
    pub fn open_in_memory(store: &str) -> Result<Self, SubstrateError> {
        Self::from_connection(Connection::open_in_memory()?, store)
    }

    fn from_connection(conn: Connection, store: &str) -> Result<Self, SubstrateError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                store TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (store, key)
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            store: store.to_string(),
        })
    }

    /// Another logical store sharing this connection.
    pub fn with_store(&self, store: &str) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            store: store.to_string(),
        }
    }

    async fn run<R, F>(&self, op: F) -> Result<R, SubstrateError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<R, SubstrateError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut conn, &store)
        })
        .await
        .map_err(|e| SubstrateError::Task(e.to_string()))?
    }
}

impl std::fmt::Debug for SqliteSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSubstrate")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Substrate for SqliteSubstrate {
    async fn get(&self, key: &str) -> Result<Option<Value>, SubstrateError> {
        let key = key.to_string();
        self.run(move |conn, store| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM kv WHERE store = ?1 AND key = ?2",
                    params![store, key],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), SubstrateError> {
        let key = key.to_string();
        self.run(move |conn, store| {
            let raw = serde_json::to_string(&value)?;
            conn.execute(
                "INSERT INTO kv (store, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(store, key) DO UPDATE SET value = excluded.value",
                params![store, key, raw],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool, SubstrateError> {
        let key = key.to_string();
        self.run(move |conn, store| {
            let removed = conn.execute(
                "DELETE FROM kv WHERE store = ?1 AND key = ?2",
                params![store, key],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, SubstrateError> {
        let prefix = prefix.to_string();
        self.run(move |conn, store| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM kv
                 WHERE store = ?1 AND substr(key, 1, length(?2)) = ?2
                 ORDER BY key ASC",
            )?;
            let rows = stmt.query_map(params![store, prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (key, raw) = row?;
                entries.push((key, serde_json::from_str(&raw)?));
            }
            Ok(entries)
        })
        .await
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, SubstrateError> {
        let prefix = prefix.to_string();
        self.run(move |conn, store| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM kv WHERE store = ?1 AND substr(key, 1, length(?2)) = ?2",
                params![store, prefix],
            )?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }
}
