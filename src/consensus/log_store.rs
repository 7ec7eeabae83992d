//! Durable replication state.
//!
//! Everything a member must not forget across restarts lives under `raft/` in the node's
//! [`Storage`]:
//!
//! | Key                   | Value                                      |
//! |-----------------------|--------------------------------------------|
//! | `raft/state`          | [`HardState`]: term, vote, bootstrap membership |
//! | `raft/snapshot`       | [`SnapshotRecord`]: compacted prefix       |
//! | `raft/log/<index>`    | one [`LogEntry`], index zero padded to 20 digits |

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{base64_bytes, Configuration, LogEntry, NodeId};
use crate::errors::{GatewayError, Result};
use crate::storage::Storage;

const HARD_STATE_KEY: &str = "raft/state";
const SNAPSHOT_KEY: &str = "raft/snapshot";
const LOG_PREFIX: &str = "raft/log/";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voted_for: Option<NodeId>,
    /// Membership installed by bootstrap, used until a configuration entry replaces it
    #[serde(default)]
    pub bootstrap: Configuration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub index: u64,
    pub term: u64,
    /// Membership as of `index`
    pub configuration: Configuration,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// State read back on startup.
#[derive(Debug, Default)]
pub struct Recovered {
    pub hard_state: HardState,
    pub snapshot: Option<SnapshotRecord>,
    /// Contiguous entries following the snapshot
    pub entries: Vec<LogEntry>,
}

fn entry_key(index: u64) -> String {
    format!("{}{:020}", LOG_PREFIX, index)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| GatewayError::serialization(format!("failed to decode {}", what), e))
}

fn encode<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| GatewayError::serialization(format!("failed to encode {}", what), e))
}

pub struct LogStore {
    storage: Arc<dyn Storage>,
}

impl LogStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn load(&self) -> Result<Recovered> {
        let hard_state = match self.storage.get(HARD_STATE_KEY).await {
            Ok(bytes) => decode(&bytes, "raft hard state")?,
            Err(e) if e.is_not_found() => HardState::default(),
            Err(e) => return Err(e),
        };
        let snapshot: Option<SnapshotRecord> = match self.storage.get(SNAPSHOT_KEY).await {
            Ok(bytes) => Some(decode(&bytes, "raft snapshot")?),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let snapshot_index = snapshot.as_ref().map_or(0, |s| s.index);
        let mut entries: Vec<LogEntry> = Vec::new();
        for kv in self.storage.get_prefix(LOG_PREFIX, 0, None).await? {
            let entry: LogEntry = decode(&kv.value, "raft log entry")?;
            if entry.index <= snapshot_index {
                continue;
            }
            let expected = entries.last().map_or(snapshot_index + 1, |e| e.index + 1);
            if entry.index != expected {
                warn!(index = entry.index, expected, "ignoring raft log entries after a gap");
                break;
            }
            entries.push(entry);
        }
        debug!(
            term = hard_state.current_term,
            snapshot_index,
            entries = entries.len(),
            "raft state loaded"
        );
        Ok(Recovered {
            hard_state,
            snapshot,
            entries,
        })
    }

    pub async fn save_hard_state(&self, state: &HardState) -> Result<()> {
        self.storage.set(HARD_STATE_KEY, encode(state, "raft hard state")?).await
    }

    pub async fn append(&self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            self.storage
                .set(&entry_key(entry.index), encode(entry, "raft log entry")?)
                .await?;
        }
        Ok(())
    }

    /// Remove the entry at `index` and everything after it.
    pub async fn truncate_from(&self, index: u64) -> Result<()> {
        let cutoff = entry_key(index);
        self.storage
            .iterate_txn_prefix(LOG_PREFIX, &mut |txn, key| {
                if key >= cutoff.as_str() {
                    txn.delete(key)
                } else {
                    Ok(())
                }
            })
            .await
    }

    /// Store `snapshot`, then drop the entries it covers. With `discard_log` every entry
    /// goes, for snapshots that replace a conflicting log.
    pub async fn save_snapshot(&self, snapshot: &SnapshotRecord, discard_log: bool) -> Result<()> {
        self.storage.set(SNAPSHOT_KEY, encode(snapshot, "raft snapshot")?).await?;
        let last = entry_key(snapshot.index);
        self.storage
            .iterate_txn_prefix(LOG_PREFIX, &mut |txn, key| {
                if discard_log || key <= last.as_str() {
                    txn.delete(key)
                } else {
                    Ok(())
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{EntryPayload, Operation};
    use crate::storage::MemoryStorage;
    use std::collections::BTreeMap;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            payload: EntryPayload::Operation(Operation::replicated(vec![index as u8])),
        }
    }

    async fn log_store() -> (LogStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        storage.connect().await.unwrap();
        (LogStore::new(storage.clone()), storage)
    }

    #[tokio::test]
    async fn test_fresh_store_is_empty() {
        let (store, _) = log_store().await;
        let recovered = store.load().await.unwrap();
        assert_eq!(recovered.hard_state, HardState::default());
        assert!(recovered.snapshot.is_none());
        assert!(recovered.entries.is_empty());
    }

    #[tokio::test]
    async fn test_hard_state_and_entries_survive_reload() {
        let (store, storage) = log_store().await;
        let mut members = BTreeMap::new();
        members.insert("node-0".to_string(), "10.0.0.1:9090".to_string());
        let hard = HardState {
            current_term: 7,
            voted_for: Some("node-0".to_string()),
            bootstrap: Configuration::new(members),
        };
        store.save_hard_state(&hard).await.unwrap();
        store.append(&(1..=12).map(|i| entry(i, 1)).collect::<Vec<_>>()).await.unwrap();
        store.truncate_from(11).await.unwrap();
        store.append(&[entry(11, 7)]).await.unwrap();

        let reopened = LogStore::new(storage);
        let recovered = reopened.load().await.unwrap();
        assert_eq!(recovered.hard_state, hard);
        let indexes: Vec<u64> = recovered.entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, (1..=11).collect::<Vec<_>>());
        assert_eq!(recovered.entries[10].term, 7);
    }

    #[tokio::test]
    async fn test_snapshot_drops_covered_entries() {
        let (store, _) = log_store().await;
        store.append(&(1..=5).map(|i| entry(i, 2)).collect::<Vec<_>>()).await.unwrap();
        let snapshot = SnapshotRecord {
            index: 3,
            term: 2,
            configuration: Configuration::default(),
            data: b"state".to_vec(),
        };
        store.save_snapshot(&snapshot, false).await.unwrap();

        let recovered = store.load().await.unwrap();
        assert_eq!(recovered.snapshot.as_ref(), Some(&snapshot));
        let indexes: Vec<u64> = recovered.entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![4, 5]);

        store.save_snapshot(&SnapshotRecord { index: 9, ..snapshot }, true).await.unwrap();
        assert!(store.load().await.unwrap().entries.is_empty());
    }

    #[tokio::test]
    async fn test_gap_ends_recovered_log() {
        let (store, _) = log_store().await;
        store.append(&[entry(1, 1), entry(2, 1), entry(4, 1)]).await.unwrap();
        let recovered = store.load().await.unwrap();
        assert_eq!(recovered.entries.len(), 2);
    }
}
