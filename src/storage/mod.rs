//! # Storage and Persistence
//!
//! Key → bytes persistence with ordered prefix iteration and prefix-scoped transactions.
//! Three backends are provided and selected by [`StorageConfig`]:
//!
//! - [`MemoryStorage`]: ordered in-memory map, lost on restart
//! - [`FileStorage`]: durable single-file SQLite key-value table
//! - [`DebugStorage`]: in-memory store that traces every call
//!
//! Keys used by the store: `changelog/<id>` and `doc/<namespace>/<collection>/<id>`.

pub mod debug;
pub mod file;
pub mod memory;

pub use debug::DebugStorage;
pub use file::FileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{StorageConfig, StorageKind};
use crate::errors::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Callback invoked for every `(key, value)` under a prefix.
pub type ValueVisitor<'a> = dyn FnMut(&str, &[u8]) -> Result<()> + Send + 'a;

/// Callback invoked for every key under a prefix with a transaction handle.
pub type TxnVisitor<'a> = dyn FnMut(&mut dyn StorageTxn, &str) -> Result<()> + Send + 'a;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Returns `KeyNotFound` when the key is absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Returns `KeyNotFound` when the key is absent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Entries under `prefix` in key order, skipping `offset` and returning at most
    /// `limit` entries (`None` = unlimited).
    async fn get_prefix(
        &self,
        prefix: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<KeyValue>>;

    /// Visit entries under `prefix` in key order; an error from the visitor stops the walk
    /// and is returned.
    async fn iterate_values_prefix(&self, prefix: &str, visit: &mut ValueVisitor<'_>)
        -> Result<()>;

    /// Visit keys under `prefix` with a transaction. Staged writes are committed
    /// atomically when every visit succeeds and discarded otherwise.
    async fn iterate_txn_prefix(&self, prefix: &str, visit: &mut TxnVisitor<'_>) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Mark the store temporarily unavailable; operations fail with `StoreLocked`.
    fn lock(&self);

    fn unlock(&self);

    fn is_locked(&self) -> bool;
}

/// Transaction handle passed to [`Storage::iterate_txn_prefix`] visitors.
///
/// Reads observe the iterated prefix plus writes staged earlier in the same transaction.
pub trait StorageTxn: Send {
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()>;
    fn delete(&mut self, key: &str) -> Result<()>;
}

/// Staged writes over a snapshot of one prefix. Shared by every backend.
#[derive(Debug, Default)]
pub struct BufferedTxn {
    base: BTreeMap<String, Vec<u8>>,
    staged: BTreeMap<String, Option<Vec<u8>>>,
}

impl BufferedTxn {
    pub fn new(base: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            base,
            staged: BTreeMap::new(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.base.keys().cloned().collect()
    }

    /// Staged operations: `Some(value)` for writes, `None` for deletes.
    pub fn into_writes(self) -> BTreeMap<String, Option<Vec<u8>>> {
        self.staged
    }
}

impl StorageTxn for BufferedTxn {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        match self.staged.get(key) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => Err(GatewayError::key_not_found(key)),
            None => self
                .base
                .get(key)
                .cloned()
                .ok_or_else(|| GatewayError::key_not_found(key)),
        }
    }

    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.staged.insert(key.to_string(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.get(key)?;
        self.staged.insert(key.to_string(), None);
        Ok(())
    }
}

/// Lock flag shared by the backends.
#[derive(Debug, Default)]
pub(crate) struct LockFlag(AtomicBool);

impl LockFlag {
    pub(crate) fn set(&self, locked: bool) {
        self.0.store(locked, Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.get() {
            Err(GatewayError::StoreLocked)
        } else {
            Ok(())
        }
    }
}

/// Apply `offset`/`limit` to an ordered iterator of entries.
pub(crate) fn page<I>(entries: I, offset: usize, limit: Option<usize>) -> Vec<KeyValue>
where
    I: Iterator<Item = KeyValue>,
{
    let entries = entries.skip(offset);
    match limit {
        Some(limit) => entries.take(limit).collect(),
        None => entries.collect(),
    }
}

/// Build the backend selected by configuration.
pub async fn from_config(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config.kind {
        StorageKind::Memory => Arc::new(MemoryStorage::new()),
        StorageKind::Debug => Arc::new(DebugStorage::new(MemoryStorage::new())),
        StorageKind::File => {
            let directory = config.directory.as_ref().ok_or_else(|| {
                GatewayError::config("file storage requires storage.directory")
            })?;
            Arc::new(FileStorage::new(directory))
        }
    };
    tracing::info!(kind = %config.kind, "storage backend selected");
    Ok(storage)
}
