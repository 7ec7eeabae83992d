//! Durable file-backed storage.
//!
//! A single SQLite database (`flowgate.db`) inside the configured directory holds a
//! `kv(key, value)` table. Prefix scans are `prefix <= key < successor(prefix)` range
//! queries with paging pushed into SQL, so results come back in key order.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{BufferedTxn, KeyValue, LockFlag, Storage, TxnVisitor, ValueVisitor};
use crate::errors::{GatewayError, Result};

const DATABASE_FILE: &str = "flowgate.db";
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCAN_QUERY: &str = "SELECT key, value FROM kv WHERE key >= ?1 AND (?2 IS NULL OR key < ?2) \
     ORDER BY key LIMIT ?3 OFFSET ?4";

/// Smallest string greater than every string starting with `prefix`, if one exists.
fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last as u32 {
            0xD7FF => Some('\u{E000}'),
            code => char::from_u32(code + 1),
        };
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    pool: OnceCell<Pool<Sqlite>>,
    locked: LockFlag,
}

impl FileStorage {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            pool: OnceCell::new(),
            locked: LockFlag::default(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.directory.join(DATABASE_FILE)
    }

    fn pool(&self) -> Result<&Pool<Sqlite>> {
        self.locked.check()?;
        self.pool
            .get()
            .ok_or_else(|| GatewayError::storage("file storage is not connected"))
    }

    async fn scan(&self, prefix: &str, offset: usize, limit: Option<usize>) -> Result<Vec<KeyValue>> {
        let limit = limit.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let rows = sqlx::query(SCAN_QUERY)
            .bind(prefix)
            .bind(prefix_successor(prefix))
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool()?)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(KeyValue {
                    key: row.try_get("key")?,
                    value: row.try_get("value")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn connect(&self) -> Result<()> {
        let directory = self.directory.clone();
        let path = self.database_path();
        self.pool
            .get_or_try_init(|| async move {
                tokio::fs::create_dir_all(&directory).await.map_err(|e| GatewayError::Io {
                    source: e,
                    context: format!("failed to create storage directory {}", directory.display()),
                })?;
                let options = SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true)
                    .busy_timeout(SQLITE_BUSY_TIMEOUT)
                    .journal_mode(SqliteJournalMode::Wal);
                let pool = SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await?;
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY NOT NULL, value BLOB NOT NULL)",
                )
                .execute(&pool)
                .await?;
                info!(path = %path.display(), "file storage connected");
                Ok::<_, GatewayError>(pool)
            })
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(self.pool()?)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("value")?),
            None => Err(GatewayError::key_not_found(key)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool()?)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(self.pool()?)
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::key_not_found(key));
        }
        Ok(())
    }

    async fn get_prefix(
        &self,
        prefix: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<KeyValue>> {
        self.scan(prefix, offset, limit).await
    }

    async fn iterate_values_prefix(
        &self,
        prefix: &str,
        visit: &mut ValueVisitor<'_>,
    ) -> Result<()> {
        for entry in self.scan(prefix, 0, None).await? {
            visit(&entry.key, &entry.value)?;
        }
        Ok(())
    }

    async fn iterate_txn_prefix(&self, prefix: &str, visit: &mut TxnVisitor<'_>) -> Result<()> {
        let mut tx = self.pool()?.begin().await?;
        let rows = sqlx::query(SCAN_QUERY)
            .bind(prefix)
            .bind(prefix_successor(prefix))
            .bind(-1_i64)
            .bind(0_i64)
            .fetch_all(&mut *tx)
            .await?;
        let mut base = BTreeMap::new();
        for row in rows {
            base.insert(row.try_get::<String, _>("key")?, row.try_get::<Vec<u8>, _>("value")?);
        }

        let mut txn = BufferedTxn::new(base);
        for key in txn.keys() {
            visit(&mut txn, &key)?;
        }

        let writes = txn.into_writes();
        debug!(prefix = %prefix, writes = writes.len(), "committing storage transaction");
        for (key, write) in writes {
            match write {
                Some(value) => {
                    sqlx::query(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    )
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM kv WHERE key = ?1")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        Ok(())
    }

    fn lock(&self) {
        self.locked.set(true);
    }

    fn unlock(&self) {
        self.locked.set(false);
    }

    fn is_locked(&self) -> bool {
        self.locked.get()
    }
}
