//! State machine driven by the replicated log.
//!
//! Committed operations are dispatched by tag:
//!
//! - `Replicated` operations carry a JSON [`ChangeLog`] handed to the state manager with
//!   `reload = true`. Failures are returned in the apply response so the submitting leader
//!   sees them; followers only log.
//! - `Broadcasted` operations carry a [`ReadRequest`]. The `leaderInfo` key updates the
//!   cached leader advertisement; other keys are logged and ignored.
//!
//! Snapshots hold the resource graph, every document and the applied high-watermark.
//!
//! The watermark is also written to storage under `raft/applied` after every apply, since
//! the state manager persists what it applies. A restarted member resumes the log after it
//! instead of applying committed entries twice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, warn};

use super::{LeaderCell, ReadRequest, ServerInfo, LEADER_INFO_KEY};
use crate::changelog::ChangeLog;
use crate::consensus::{ApplyResponse, Operation, OperationType, StateMachine};
use crate::errors::{GatewayError, Result};
use crate::resources::ResourceSnapshot;
use crate::state::StateManager;
use crate::storage::Storage;

const WATERMARK_KEY: &str = "raft/applied";

/// Encoded form of a state machine snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Last log index folded into `resources`
    pub applied_index: u64,
    /// Id of the last change log applied before the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change_log_id: Option<String>,
    pub resources: ResourceSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Watermark {
    applied_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_change_log_id: Option<String>,
}

pub struct GatewayStateMachine {
    state: Weak<dyn StateManager>,
    leader: Arc<LeaderCell>,
    storage: Arc<dyn Storage>,
    snapshot_threshold: u64,
    watermark: Mutex<Watermark>,
}

impl GatewayStateMachine {
    pub fn new(
        state: Weak<dyn StateManager>,
        leader: Arc<LeaderCell>,
        storage: Arc<dyn Storage>,
        snapshot_threshold: u64,
    ) -> Self {
        Self {
            state,
            leader,
            storage,
            snapshot_threshold,
            watermark: Mutex::new(Watermark::default()),
        }
    }

    pub fn last_change_log_id(&self) -> Option<String> {
        self.watermark
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_change_log_id
            .clone()
    }

    pub fn applied_index(&self) -> u64 {
        self.watermark.lock().unwrap_or_else(PoisonError::into_inner).applied_index
    }

    fn state(&self) -> Result<Arc<dyn StateManager>> {
        self.state
            .upgrade()
            .ok_or_else(|| GatewayError::internal("state manager is no longer available"))
    }

    fn advance(&self, index: u64, change_log_id: Option<String>) {
        let mut watermark = self.watermark.lock().unwrap_or_else(PoisonError::into_inner);
        watermark.applied_index = watermark.applied_index.max(index);
        if change_log_id.is_some() {
            watermark.last_change_log_id = change_log_id;
        }
    }

    async fn save_watermark(&self) -> Result<()> {
        let watermark = self.watermark.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let bytes = serde_json::to_vec(&watermark)
            .map_err(|e| GatewayError::serialization("failed to encode applied index", e))?;
        self.storage.set(WATERMARK_KEY, bytes).await
    }

    async fn apply_change_log(&self, index: u64, data: &[u8]) -> ApplyResponse {
        let cl = match ChangeLog::from_bytes(data) {
            Ok(cl) => cl,
            Err(e) => {
                warn!(index, error = %e, "dropping undecodable change log");
                self.advance(index, None);
                return ApplyResponse::failed(e);
            }
        };
        let state = match self.state() {
            Ok(state) => state,
            Err(e) => return ApplyResponse::failed(e),
        };

        let id = cl.id.clone();
        let cmd = cl.cmd;
        let result = state.process_change_log(cl, true).await;
        self.advance(index, Some(id.clone()));
        match result {
            Ok(()) => {
                debug!(index, change_log_id = %id, cmd = %cmd, "change log applied");
                ApplyResponse::ok()
            }
            Err(e) => {
                warn!(index, change_log_id = %id, cmd = %cmd, error = %e, "change log rejected");
                ApplyResponse::failed(e)
            }
        }
    }

    fn apply_broadcast(&self, index: u64, data: &[u8]) -> ApplyResponse {
        self.advance(index, None);
        let request: ReadRequest = match serde_json::from_slice(data) {
            Ok(request) => request,
            Err(e) => return ApplyResponse::failed(GatewayError::serialization("invalid broadcast", e)),
        };
        match request.key.as_str() {
            LEADER_INFO_KEY => match serde_json::from_slice::<ServerInfo>(&request.data) {
                Ok(info) => {
                    info!(
                        leader_id = %info.id,
                        address = %info.address,
                        admin_advert = %info.admin_advert,
                        "leader advertisement received"
                    );
                    self.leader.store(info);
                    ApplyResponse::ok()
                }
                Err(e) => ApplyResponse::failed(GatewayError::serialization("invalid leader info", e)),
            },
            other => {
                warn!(key = %other, "ignoring broadcast with unknown key");
                ApplyResponse::ok()
            }
        }
    }
}

#[async_trait]
impl StateMachine for GatewayStateMachine {
    async fn apply(&self, index: u64, op: &Operation) -> ApplyResponse {
        let response = match op.op_type {
            OperationType::Replicated => self.apply_change_log(index, &op.data).await,
            OperationType::Broadcasted => self.apply_broadcast(index, &op.data),
        };
        if let Err(e) = self.save_watermark().await {
            warn!(index, error = %e, "failed to persist applied index");
        }
        response
    }

    async fn snapshot(&self) -> Result<Vec<u8>> {
        let resources = self.state()?.snapshot().await?;
        let snapshot = {
            let watermark = self.watermark.lock().unwrap_or_else(PoisonError::into_inner);
            StateSnapshot {
                applied_index: watermark.applied_index,
                last_change_log_id: watermark.last_change_log_id.clone(),
                resources,
            }
        };
        info!(applied_index = snapshot.applied_index, "state snapshot taken");
        serde_json::to_vec(&snapshot).map_err(|e| GatewayError::serialization("failed to encode snapshot", e))
    }

    async fn restore(&self, data: &[u8]) -> Result<()> {
        let snapshot: StateSnapshot = serde_json::from_slice(data)
            .map_err(|e| GatewayError::serialization("failed to decode snapshot", e))?;
        self.state()?.restore(&snapshot.resources).await?;
        {
            let mut watermark = self.watermark.lock().unwrap_or_else(PoisonError::into_inner);
            watermark.applied_index = snapshot.applied_index;
            watermark.last_change_log_id = snapshot.last_change_log_id.clone();
        }
        self.save_watermark().await?;
        info!(
            applied_index = snapshot.applied_index,
            last_change_log_id = ?snapshot.last_change_log_id,
            "state restored from snapshot"
        );
        Ok(())
    }

    fn need_snapshot(&self, log_size: u64) -> bool {
        self.snapshot_threshold > 0 && log_size >= self.snapshot_threshold
    }

    async fn recover(&self) -> Result<u64> {
        let watermark: Watermark = match self.storage.get(WATERMARK_KEY).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| GatewayError::serialization("failed to decode applied index", e))?,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };
        let applied_index = watermark.applied_index;
        debug!(applied_index, last_change_log_id = ?watermark.last_change_log_id, "applied index recovered");
        *self.watermark.lock().unwrap_or_else(PoisonError::into_inner) = watermark;
        Ok(applied_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{Command, Resource};
    use crate::resources::{Document, Namespace};
    use crate::storage::MemoryStorage;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct Recorder {
        processed: AsyncMutex<Vec<ChangeLog>>,
        restored: AsyncMutex<Option<ResourceSnapshot>>,
    }

    #[async_trait]
    impl StateManager for Recorder {
        async fn process_change_log(&self, cl: ChangeLog, _reload: bool) -> Result<()> {
            if cl.name == "broken" {
                return Err(GatewayError::not_found("namespace", "broken"));
            }
            self.processed.lock().await.push(cl);
            Ok(())
        }

        async fn snapshot(&self) -> Result<ResourceSnapshot> {
            let document = Document::new("o-1", "team", "orders", serde_json::json!({"total": 12}));
            Ok(ResourceSnapshot {
                namespaces: vec![Namespace::new("team")],
                documents: vec![document],
                ..Default::default()
            })
        }

        async fn restore(&self, snapshot: &ResourceSnapshot) -> Result<()> {
            *self.restored.lock().await = Some(snapshot.clone());
            Ok(())
        }
    }

    fn machine(recorder: &Arc<Recorder>, threshold: u64) -> (GatewayStateMachine, Arc<LeaderCell>) {
        machine_on(recorder, Arc::new(MemoryStorage::new()), threshold)
    }

    fn machine_on(
        recorder: &Arc<Recorder>,
        storage: Arc<MemoryStorage>,
        threshold: u64,
    ) -> (GatewayStateMachine, Arc<LeaderCell>) {
        let state: Arc<dyn StateManager> = recorder.clone();
        let leader = Arc::new(LeaderCell::default());
        (
            GatewayStateMachine::new(Arc::downgrade(&state), leader.clone(), storage, threshold),
            leader,
        )
    }

    fn change_log(name: &str) -> Operation {
        let cl = ChangeLog::new(Command::add(Resource::Namespace), "", name, &Namespace::new(name)).unwrap();
        Operation::replicated(cl.to_bytes().unwrap())
    }

    #[tokio::test]
    async fn test_replicated_change_log_reaches_state_manager() {
        let recorder = Arc::new(Recorder::default());
        let (fsm, _) = machine(&recorder, 0);

        assert!(fsm.apply(3, &change_log("team")).await.success);
        let resp = fsm.apply(4, &change_log("broken")).await;
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("namespace not found: broken"));
        assert_eq!(recorder.processed.lock().await.len(), 1);
        assert_eq!(fsm.applied_index(), 4);

        let garbage = fsm.apply(5, &Operation::replicated(b"not json".to_vec())).await;
        assert!(!garbage.success);
    }

    #[tokio::test]
    async fn test_leader_info_broadcast_is_cached() {
        let recorder = Arc::new(Recorder::default());
        let (fsm, leader) = machine(&recorder, 0);
        let info = ServerInfo {
            id: "node-1".to_string(),
            address: "10.0.0.1:9090".to_string(),
            admin_advert: "http://10.0.0.1:9080".to_string(),
        };
        let op = Operation::broadcasted(ReadRequest::leader_info(&info).unwrap().to_bytes().unwrap());
        assert!(fsm.apply(1, &op).await.success);
        assert_eq!(leader.load().as_deref(), Some(&info));

        let unknown = ReadRequest {
            key: "somethingElse".to_string(),
            data: Vec::new(),
        };
        let op = Operation::broadcasted(unknown.to_bytes().unwrap());
        assert!(fsm.apply(2, &op).await.success);
        assert_eq!(leader.load().as_deref(), Some(&info));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_watermark() {
        let recorder = Arc::new(Recorder::default());
        let (fsm, _) = machine(&recorder, 10);
        fsm.apply(7, &change_log("team")).await;
        let data = fsm.snapshot().await.unwrap();

        let other = Arc::new(Recorder::default());
        let (restored, _) = machine(&other, 10);
        restored.restore(&data).await.unwrap();
        assert_eq!(restored.applied_index(), 7);
        let restored_snapshot = other.restored.lock().await.clone().unwrap();
        assert_eq!(restored_snapshot.namespaces[0].name, "team");
        assert_eq!(restored_snapshot.documents.len(), 1);
        assert_eq!(restored_snapshot.documents[0].data["total"], 12);

        assert!(!fsm.need_snapshot(9));
        assert!(fsm.need_snapshot(10));
    }

    #[tokio::test]
    async fn test_applied_index_survives_restart() {
        let recorder = Arc::new(Recorder::default());
        let storage = Arc::new(MemoryStorage::new());
        let (fsm, _) = machine_on(&recorder, storage.clone(), 0);
        assert_eq!(fsm.recover().await.unwrap(), 0);

        fsm.apply(3, &change_log("team")).await;
        let id = fsm.last_change_log_id();
        assert!(id.is_some());

        // restarted member over the same storage
        let (restarted, _) = machine_on(&recorder, storage, 0);
        assert_eq!(restarted.recover().await.unwrap(), 3);
        assert_eq!(restarted.applied_index(), 3);
        assert_eq!(restarted.last_change_log_id(), id);
    }
}
