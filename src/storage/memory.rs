//! In-memory storage backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{page, BufferedTxn, KeyValue, LockFlag, Storage, TxnVisitor, ValueVisitor};
use crate::errors::{GatewayError, Result};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    tree: RwLock<BTreeMap<String, Vec<u8>>>,
    locked: LockFlag,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn prefixed<'a>(
    tree: &'a BTreeMap<String, Vec<u8>>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a Vec<u8>)> + 'a {
    tree.range(prefix.to_string()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.locked.check()?;
        self.tree
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| GatewayError::key_not_found(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.locked.check()?;
        self.tree.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.locked.check()?;
        self.tree
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| GatewayError::key_not_found(key))
    }

    async fn get_prefix(
        &self,
        prefix: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<KeyValue>> {
        self.locked.check()?;
        let tree = self.tree.read().await;
        let entries = prefixed(&tree, prefix).map(|(k, v)| KeyValue {
            key: k.clone(),
            value: v.clone(),
        });
        Ok(page(entries, offset, limit))
    }

    async fn iterate_values_prefix(
        &self,
        prefix: &str,
        visit: &mut ValueVisitor<'_>,
    ) -> Result<()> {
        self.locked.check()?;
        let tree = self.tree.read().await;
        for (key, value) in prefixed(&tree, prefix) {
            visit(key, value)?;
        }
        Ok(())
    }

    async fn iterate_txn_prefix(&self, prefix: &str, visit: &mut TxnVisitor<'_>) -> Result<()> {
        self.locked.check()?;
        let mut tree = self.tree.write().await;
        let base: BTreeMap<String, Vec<u8>> = prefixed(&tree, prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut txn = BufferedTxn::new(base);
        for key in txn.keys() {
            visit(&mut txn, &key)?;
        }
        for (key, write) in txn.into_writes() {
            match write {
                Some(value) => {
                    tree.insert(key, value);
                }
                None => {
                    tree.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
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
