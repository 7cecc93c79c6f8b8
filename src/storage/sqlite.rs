use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};
use tokio_rusqlite::{Connection, params};

use super::{BackendKind, Namespace, Storage, validate_namespace};
use crate::error::StorageError;

/// Single-file transactional store: one `kv` table keyed by (namespace, key).
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = Connection::open(path)
            .await
            .map_err(StorageError::backend)?;
        Self::init(conn, true).await
    }

    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(StorageError::backend)?;
        Self::init(conn, false).await
    }

    async fn init(conn: Connection, wal: bool) -> Result<Self, StorageError> {
        conn.call(move |c| {
            let schema = include_str!("schema.sql");
            c.execute_batch(schema)?;

            // Per-connection; needed for the namespace cascade.
            c.execute_batch("PRAGMA foreign_keys = ON;")?;
            if wal {
                c.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;
            }

            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(StorageError::backend)?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn open(&self, namespace: &str) -> Result<Arc<dyn Namespace>, StorageError> {
        validate_namespace(namespace)?;

        let name = namespace.to_string();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT OR IGNORE INTO namespaces (name) VALUES (?1)",
                    params![name],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .map_err(StorageError::backend)?;

        Ok(Arc::new(SqliteNamespace {
            conn: self.conn.clone(),
            name: namespace.to_string(),
        }))
    }

    async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        self.conn
            .call(|c| {
                let mut stmt = c.prepare(
                    "SELECT n.name FROM namespaces n
                     WHERE EXISTS (SELECT 1 FROM kv WHERE kv.namespace = n.name)
                     ORDER BY n.name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(names)
            })
            .await
            .map_err(StorageError::backend)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool, StorageError> {
        let name = namespace.to_string();
        self.conn
            .call(move |c| {
                let tx = c.transaction()?;
                let keys = tx.execute("DELETE FROM kv WHERE namespace = ?1", params![name])?;
                let rows = tx.execute("DELETE FROM namespaces WHERE name = ?1", params![name])?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(keys > 0 || rows > 0)
            })
            .await
            .map_err(StorageError::backend)
    }
}

struct SqliteNamespace {
    conn: Connection,
    name: String,
}

#[async_trait]
impl Namespace for SqliteNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let ns = self.name.clone();
        let k = key.to_string();
        let value = self
            .conn
            .call(move |c| {
                c.query_row(
                    "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                    params![ns, k],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()
            })
            .await
            .map_err(StorageError::backend)?;

        value.ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let ns = self.name.clone();
        let k = key.to_string();
        let v = value.to_vec();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(namespace, key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = CURRENT_TIMESTAMP",
                    params![ns, k, v],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .map_err(StorageError::backend)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let ns = self.name.clone();
        let k = key.to_string();
        let removed = self
            .conn
            .call(move |c| {
                c.execute(
                    "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
                    params![ns, k],
                )
            })
            .await
            .map_err(StorageError::backend)?;

        if removed == 0 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let ns = self.name.clone();
        let p = prefix.to_string();
        self.conn
            .call(move |c| {
                // substr() instead of LIKE: keys may contain '%' and '_'.
                let mut stmt = c.prepare(
                    "SELECT key, value FROM kv
                     WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2
                     ORDER BY key",
                )?;
                let rows = stmt
                    .query_map(params![ns, p], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(rows)
            })
            .await
            .map_err(StorageError::backend)
    }
}
