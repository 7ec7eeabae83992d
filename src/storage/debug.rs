//! Tracing wrapper around another backend.

use async_trait::async_trait;
use tracing::{debug, Instrument};

use super::{KeyValue, Storage, TxnVisitor, ValueVisitor};
use crate::errors::Result;
use crate::storage_span;

#[derive(Debug)]
pub struct DebugStorage<S> {
    inner: S,
}

impl<S: Storage> DebugStorage<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn outcome<T>(result: &Result<T>) -> String {
    match result {
        Ok(_) => "ok".to_string(),
        Err(e) => e.to_string(),
    }
}

#[async_trait]
impl<S: Storage> Storage for DebugStorage<S> {
    async fn connect(&self) -> Result<()> {
        let result = self.inner.connect().instrument(storage_span!("connect")).await;
        debug!(result = %outcome(&result), "storage connect");
        result
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let result = self.inner.get(key).instrument(storage_span!("get", key = %key)).await;
        debug!(
            key = %key,
            bytes = result.as_ref().map(|v| v.len()).unwrap_or_default(),
            result = %outcome(&result),
            "storage get"
        );
        result
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let bytes = value.len();
        let result = self.inner.set(key, value).instrument(storage_span!("set", key = %key)).await;
        debug!(key = %key, bytes, result = %outcome(&result), "storage set");
        result
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let result = self.inner.delete(key).instrument(storage_span!("delete", key = %key)).await;
        debug!(key = %key, result = %outcome(&result), "storage delete");
        result
    }

    async fn get_prefix(
        &self,
        prefix: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<KeyValue>> {
        let result = self
            .inner
            .get_prefix(prefix, offset, limit)
            .instrument(storage_span!("get_prefix", prefix = %prefix))
            .await;
        debug!(
            prefix = %prefix,
            offset,
            limit = ?limit,
            entries = result.as_ref().map(|v| v.len()).unwrap_or_default(),
            result = %outcome(&result),
            "storage get_prefix"
        );
        result
    }

    async fn iterate_values_prefix(
        &self,
        prefix: &str,
        visit: &mut ValueVisitor<'_>,
    ) -> Result<()> {
        let mut visited = 0usize;
        let result = self
            .inner
            .iterate_values_prefix(prefix, &mut |key, value| {
                visited += 1;
                debug!(key = %key, bytes = value.len(), "storage visit");
                visit(key, value)
            })
            .await;
        debug!(prefix = %prefix, visited, result = %outcome(&result), "storage iterate_values_prefix");
        result
    }

    async fn iterate_txn_prefix(&self, prefix: &str, visit: &mut TxnVisitor<'_>) -> Result<()> {
        let mut visited = 0usize;
        let result = self
            .inner
            .iterate_txn_prefix(prefix, &mut |txn, key| {
                visited += 1;
                debug!(key = %key, "storage txn visit");
                visit(txn, key)
            })
            .await;
        debug!(prefix = %prefix, visited, result = %outcome(&result), "storage iterate_txn_prefix");
        result
    }

    async fn close(&self) -> Result<()> {
        let result = self.inner.close().await;
        debug!(result = %outcome(&result), "storage close");
        result
    }

    fn lock(&self) {
        debug!("storage locked");
        self.inner.lock();
    }

    fn unlock(&self) {
        debug!("storage unlocked");
        self.inner.unlock();
    }

    fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}
