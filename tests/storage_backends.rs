//! Integration tests running the same storage contract against every backend

use flowgate::errors::{GatewayError, Result};
use flowgate::storage::{DebugStorage, FileStorage, MemoryStorage, Storage, StorageTxn};
use std::sync::Arc;
use tempfile::TempDir;

async fn backends() -> (Vec<(&'static str, Arc<dyn Storage>)>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let backends: Vec<(&'static str, Arc<dyn Storage>)> = vec![
        ("memory", Arc::new(MemoryStorage::new())),
        ("debug", Arc::new(DebugStorage::new(MemoryStorage::new()))),
        ("file", Arc::new(FileStorage::new(dir.path()))),
    ];
    for (_, storage) in &backends {
        storage.connect().await.unwrap();
    }
    (backends, dir)
}

async fn seed(storage: &dyn Storage) {
    for (key, value) in [
        ("changelog/0003", "c"),
        ("changelog/0001", "a"),
        ("changelog/0002", "b"),
        ("doc/default/users/1", "u1"),
        ("doc/default/users/2", "u2"),
    ] {
        storage.set(key, value.as_bytes().to_vec()).await.unwrap();
    }
}

fn keys(entries: &[flowgate::storage::KeyValue]) -> Vec<&str> {
    entries.iter().map(|kv| kv.key.as_str()).collect()
}

#[tokio::test]
async fn test_get_set_delete() {
    let (backends, _dir) = backends().await;
    for (name, storage) in backends {
        storage.set("doc/a", b"1".to_vec()).await.unwrap();
        storage.set("doc/a", b"2".to_vec()).await.unwrap();
        assert_eq!(storage.get("doc/a").await.unwrap(), b"2", "{}", name);

        storage.delete("doc/a").await.unwrap();
        assert!(storage.get("doc/a").await.unwrap_err().is_not_found(), "{}", name);
        assert!(
            matches!(storage.delete("doc/a").await, Err(GatewayError::KeyNotFound { .. })),
            "{}",
            name
        );
        storage.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_prefix_listing_is_ordered_and_paged() {
    let (backends, _dir) = backends().await;
    for (name, storage) in backends {
        seed(storage.as_ref()).await;

        let all = storage.get_prefix("changelog/", 0, None).await.unwrap();
        assert_eq!(
            keys(&all),
            vec!["changelog/0001", "changelog/0002", "changelog/0003"],
            "{}",
            name
        );
        let page = storage.get_prefix("changelog/", 1, Some(1)).await.unwrap();
        assert_eq!(keys(&page), vec!["changelog/0002"], "{}", name);
        assert!(storage.get_prefix("nothing/", 0, None).await.unwrap().is_empty());
        storage.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_value_iteration_stops_on_error() {
    let (backends, _dir) = backends().await;
    for (name, storage) in backends {
        seed(storage.as_ref()).await;

        let mut seen = Vec::new();
        let mut visit = |key: &str, _value: &[u8]| -> Result<()> {
            seen.push(key.to_string());
            if seen.len() == 2 {
                return Err(GatewayError::internal("stop"));
            }
            Ok(())
        };
        let err = storage.iterate_values_prefix("changelog/", &mut visit).await.unwrap_err();
        assert!(err.to_string().contains("stop"), "{}", name);
        assert_eq!(seen, vec!["changelog/0001", "changelog/0002"], "{}", name);
        storage.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_transaction_commits_or_discards() {
    let (backends, _dir) = backends().await;
    for (name, storage) in backends {
        seed(storage.as_ref()).await;

        let mut rename = |txn: &mut dyn StorageTxn, key: &str| -> Result<()> {
            let value = txn.get(key)?;
            txn.set(&key.replace("users", "members"), value)?;
            txn.delete(key)
        };
        storage.iterate_txn_prefix("doc/default/users/", &mut rename).await.unwrap();
        assert!(storage.get_prefix("doc/default/users/", 0, None).await.unwrap().is_empty(), "{}", name);
        assert_eq!(storage.get("doc/default/members/2").await.unwrap(), b"u2", "{}", name);

        let mut failing = |txn: &mut dyn StorageTxn, key: &str| -> Result<()> {
            txn.delete(key)?;
            Err(GatewayError::internal("abort"))
        };
        assert!(storage.iterate_txn_prefix("changelog/", &mut failing).await.is_err());
        assert_eq!(storage.get_prefix("changelog/", 0, None).await.unwrap().len(), 3, "{}", name);
        storage.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_locked_storage_rejects_operations() {
    let (backends, _dir) = backends().await;
    for (name, storage) in backends {
        storage.lock();
        assert!(storage.is_locked());
        assert!(
            matches!(storage.set("k", vec![]).await, Err(GatewayError::StoreLocked)),
            "{}",
            name
        );
        storage.unlock();
        storage.set("k", vec![]).await.unwrap();
        storage.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_file_storage_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = FileStorage::new(dir.path());
        storage.connect().await.unwrap();
        storage.set("changelog/0001", b"persisted".to_vec()).await.unwrap();
        storage.close().await.unwrap();
    }
    let storage = FileStorage::new(dir.path());
    storage.connect().await.unwrap();
    assert_eq!(storage.get("changelog/0001").await.unwrap(), b"persisted");
    storage.close().await.unwrap();
}
