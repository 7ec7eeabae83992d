//! # Replicated Store
//!
//! The [`Store`] binds the change-log engine to storage and, when replication is enabled,
//! to the replicated log:
//!
//! - change logs submitted on the leader are replicated as `Replicated` operations and
//!   applied on every member by [`fsm::GatewayStateMachine`]
//! - without replication, change logs are written straight to storage
//! - documents are data rather than configuration and always go straight to storage
//! - the leader advertises its admin address to followers with a `Broadcasted`
//!   `leaderInfo` operation from a dedicated task started in [`Store::init`]
//!
//! Storage key layout: `changelog/<id>` and `doc/<namespace>/<collection>/<id>`.

pub mod discovery;
pub mod fsm;

pub use discovery::parse_cluster;
pub use fsm::{GatewayStateMachine, StateSnapshot};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::changelog::{ChangeLog, CHANGELOG_PREFIX};
use crate::config::{AdminConfig, AppConfig, ReplicationConfig};
use crate::consensus::{
    Configuration, Consensus, ConsensusTransport, HttpTransport, MembershipChange, NodeId, Operation,
    RaftOptions, RaftStats, ReplicatedLog, Role,
};
use crate::consensus::http::HttpTransportOptions;
use crate::errors::{GatewayError, Result};
use crate::resources::Document;
use crate::state::StateManager;
use crate::storage::{self, Storage};

/// Broadcast key carrying the leader's [`ServerInfo`].
pub const LEADER_INFO_KEY: &str = "leaderInfo";

/// Storage prefix for documents.
pub const DOCUMENT_PREFIX: &str = "doc/";

const CHANGELOG_WRITE_RETRIES: u32 = 30;
const CHANGELOG_WRITE_BACKOFF: Duration = Duration::from_micros(100);
const ADVERTISE_RETRY: Duration = Duration::from_millis(250);

/// Identity a leader advertises to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: NodeId,
    pub address: String,
    #[serde(rename = "adminAdvert")]
    pub admin_advert: String,
}

/// Payload of a `Broadcasted` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub key: String,
    #[serde(with = "crate::consensus::base64_bytes")]
    pub data: Vec<u8>,
}

impl ReadRequest {
    pub fn leader_info(info: &ServerInfo) -> Result<Self> {
        Ok(Self {
            key: LEADER_INFO_KEY.to_string(),
            data: serde_json::to_vec(info)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| GatewayError::serialization("failed to encode read request", e))
    }
}

/// Most recent leader advertisement, shared by the state machine (writer) and the
/// admin redirect path (reader).
#[derive(Debug, Default)]
pub struct LeaderCell {
    info: RwLock<Option<Arc<ServerInfo>>>,
}

impl LeaderCell {
    pub fn load(&self) -> Option<Arc<ServerInfo>> {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn store(&self, info: ServerInfo) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(info));
    }
}

/// Replication lifecycle as seen by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// No stable leader observed yet
    FollowerPending,
    Follower,
    Leader,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeState::FollowerPending => "follower_pending",
            NodeState::Follower => "follower",
            NodeState::Leader => "leader",
        })
    }
}

/// Replication settings resolved from node, replication and admin configuration.
#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    pub id: NodeId,
    pub advert_address: String,
    pub admin_advert: String,
    pub bootstrap_cluster: bool,
    pub cluster_address: BTreeMap<String, String>,
    pub discovery_domain: Option<String>,
    pub discovery_port: u16,
    pub apply_timeout: Duration,
    pub raft: RaftOptions,
    pub snapshot_threshold: u64,
}

impl ReplicationSettings {
    pub fn from_config(node_id: &str, replication: &ReplicationConfig, admin: &AdminConfig) -> Self {
        let id = if replication.id.is_empty() {
            node_id.to_string()
        } else {
            replication.id.clone()
        };
        Self {
            id,
            advert_address: replication.advert_address.clone(),
            admin_advert: admin.advertised(),
            bootstrap_cluster: replication.bootstrap_cluster,
            cluster_address: replication.cluster_address.clone(),
            discovery_domain: replication.discovery_domain.clone(),
            discovery_port: replication.advert_port().unwrap_or(9090),
            apply_timeout: replication.apply_timeout(),
            raft: RaftOptions::from(replication),
            snapshot_threshold: replication.snapshot_threshold,
        }
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            id: self.id.clone(),
            address: self.advert_address.clone(),
            admin_advert: self.admin_advert.clone(),
        }
    }
}

struct Replication {
    settings: ReplicationSettings,
    transport: Arc<dyn ConsensusTransport>,
    consensus: once_cell::sync::OnceCell<Arc<dyn Consensus>>,
    leader: Arc<LeaderCell>,
    advertiser: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

pub struct Store {
    storage: Arc<dyn Storage>,
    replication: Option<Replication>,
}

/// Escape a key segment so `/` only ever separates segments.
fn key_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}

fn document_key(namespace: &str, collection: &str, id: &str) -> String {
    format!(
        "{}{}/{}/{}",
        DOCUMENT_PREFIX,
        key_segment(namespace),
        key_segment(collection),
        key_segment(id)
    )
}

impl Store {
    /// A store without replication.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            replication: None,
        }
    }

    /// A store replicating change logs over `transport`.
    pub fn replicated(
        storage: Arc<dyn Storage>,
        settings: ReplicationSettings,
        transport: Arc<dyn ConsensusTransport>,
    ) -> Self {
        Self {
            storage,
            replication: Some(Replication {
                settings,
                transport,
                consensus: once_cell::sync::OnceCell::new(),
                leader: Arc::new(LeaderCell::default()),
                advertiser: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Build storage and, when configured, the HTTP replication transport.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let storage = storage::from_config(&config.storage).await?;
        match &config.replication {
            None => Ok(Self::new(storage)),
            Some(replication) => {
                let settings = ReplicationSettings::from_config(&config.node.id, replication, &config.admin);
                let transport = HttpTransport::new(HttpTransportOptions::from(replication))?;
                Ok(Self::replicated(storage, settings, Arc::new(transport)))
            }
        }
    }

    /// Connect storage, then start replication.
    pub async fn init(&self, state: Weak<dyn StateManager>) -> Result<()> {
        self.connect().await?;
        self.start_replication(state).await
    }

    pub async fn connect(&self) -> Result<()> {
        self.storage.connect().await
    }

    /// Start the replicated log, bootstrap the cluster when needed and spawn the
    /// leader-advertisement task. Does nothing without replication.
    pub async fn start_replication(&self, state: Weak<dyn StateManager>) -> Result<()> {
        let Some(replication) = &self.replication else {
            info!("replication disabled, change logs are stored locally");
            return Ok(());
        };
        let settings = &replication.settings;

        let fsm = Arc::new(GatewayStateMachine::new(
            state,
            Arc::clone(&replication.leader),
            Arc::clone(&self.storage),
            settings.snapshot_threshold,
        ));
        let log: Arc<dyn Consensus> = Arc::new(ReplicatedLog::new(
            settings.id.clone(),
            Arc::clone(&replication.transport),
            fsm,
            Arc::clone(&self.storage),
            settings.raft.clone(),
        ));
        replication
            .consensus
            .set(Arc::clone(&log))
            .map_err(|_| GatewayError::internal("store is already initialised"))?;
        log.start().await?;

        if settings.bootstrap_cluster && log.configuration().is_empty() {
            let mut members = parse_cluster(
                &settings.cluster_address,
                settings.discovery_domain.as_deref(),
                settings.discovery_port,
            )
            .await?;
            members
                .entry(settings.id.clone())
                .or_insert_with(|| settings.advert_address.clone());
            debug!(members = ?members, "bootstrap configuration");
            log.bootstrap(Configuration::new(members)).await?;
        }

        let task = tokio::spawn(advertise_leadership(
            log,
            settings.server_info(),
            settings.apply_timeout,
            replication.shutdown.clone(),
        ));
        *replication
            .advertiser
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        info!(node_id = %settings.id, "replicated store started");
        Ok(())
    }

    fn consensus(&self) -> Option<&Arc<dyn Consensus>> {
        self.replication.as_ref().and_then(|r| r.consensus.get())
    }

    pub fn replication_enabled(&self) -> bool {
        self.replication.is_some()
    }

    /// True only on the current leader of a replicated cluster.
    pub fn is_leader(&self) -> bool {
        self.consensus().is_some_and(|c| c.is_leader())
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.consensus().and_then(|c| c.leader_id())
    }

    fn require_consensus(&self) -> Result<(&Arc<dyn Consensus>, Duration)> {
        let replication = self
            .replication
            .as_ref()
            .ok_or_else(|| GatewayError::consensus("replication is not enabled"))?;
        let consensus = replication
            .consensus
            .get()
            .ok_or_else(|| GatewayError::consensus("replication is not running"))?;
        Ok((consensus, replication.settings.apply_timeout))
    }

    /// Add, promote, demote or remove a cluster member. Leader only.
    pub async fn change_membership(&self, change: MembershipChange) -> Result<Configuration> {
        let (consensus, timeout) = self.require_consensus()?;
        consensus.change_membership(change, timeout).await
    }

    /// Hand leadership to `target`, or to the most up-to-date voter. Leader only.
    pub async fn transfer_leadership(&self, target: Option<NodeId>) -> Result<NodeId> {
        let (consensus, timeout) = self.require_consensus()?;
        consensus.transfer_leadership(target, timeout).await
    }

    pub fn raft_stats(&self) -> Option<RaftStats> {
        self.consensus().map(|c| c.stats())
    }

    /// Admin address of the current leader, when its advertisement has been received.
    pub fn leader_admin_addr(&self) -> Option<String> {
        let replication = self.replication.as_ref()?;
        let leader_id = replication.consensus.get()?.leader_id()?;
        let info = replication.leader.load()?;
        (info.id == leader_id).then(|| info.admin_advert.clone())
    }

    pub fn node_state(&self) -> NodeState {
        let Some(consensus) = self.consensus() else {
            return if self.replication_enabled() {
                NodeState::FollowerPending
            } else {
                NodeState::Leader
            };
        };
        match (consensus.role(), consensus.leader_id()) {
            (Role::Leader, _) => NodeState::Leader,
            (Role::Follower, Some(_)) => NodeState::Follower,
            _ => NodeState::FollowerPending,
        }
    }

    /// Wait until some member holds leadership.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let consensus = self
            .consensus()
            .ok_or_else(|| GatewayError::consensus("replication is not running"))?;
        let mut rx = consensus.subscribe_leader();
        let state = tokio::time::timeout(timeout, rx.wait_for(|s| s.leader_id.is_some()))
            .await
            .map_err(|_| GatewayError::consensus("no leader elected in time"))?
            .map_err(|_| GatewayError::consensus("replicated log stopped"))?;
        state
            .leader_id
            .clone()
            .ok_or_else(|| GatewayError::consensus("no leader elected"))
    }

    // Change logs

    /// Submit a change log.
    ///
    /// With replication this must run on the leader and blocks until the change log is
    /// applied or the apply timeout elapses. Without replication it is written to storage.
    pub async fn store_change_log(&self, cl: &ChangeLog) -> Result<()> {
        let Some(replication) = &self.replication else {
            return self.persist_change_log(cl).await;
        };
        let consensus = replication
            .consensus
            .get()
            .ok_or_else(|| GatewayError::consensus("replication is not running"))?;
        if !consensus.is_leader() {
            return Err(GatewayError::NotLeader);
        }
        let op = Operation::replicated(cl.to_bytes()?);
        consensus
            .submit(op, replication.settings.apply_timeout)
            .await?
            .into_result()
    }

    /// Write a change log to local storage, retrying transient failures.
    pub async fn persist_change_log(&self, cl: &ChangeLog) -> Result<()> {
        let bytes = cl.to_bytes()?;
        let key = cl.storage_key();
        let mut retries = CHANGELOG_WRITE_RETRIES;
        loop {
            match self.storage.set(&key, bytes.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if retries > 0 => {
                    warn!(key = %key, retries, error = %e, "failed to store change log, retrying");
                    retries -= 1;
                    tokio::time::sleep(CHANGELOG_WRITE_BACKOFF).await;
                }
                Err(e) => {
                    error!(key = %key, error = %e, "giving up storing change log");
                    return Err(e);
                }
            }
        }
    }

    /// All stored change logs in id order.
    pub async fn fetch_change_logs(&self) -> Result<Vec<ChangeLog>> {
        let entries = self.storage.get_prefix(CHANGELOG_PREFIX, 0, None).await?;
        debug!(count = entries.len(), "fetched change logs");
        entries
            .iter()
            .map(|kv| ChangeLog::from_bytes(&kv.value))
            .collect()
    }

    /// Remove change logs, returning how many were removed before any failure.
    pub async fn delete_change_logs(&self, logs: &[ChangeLog]) -> Result<usize> {
        let mut removed = 0;
        for cl in logs {
            match self.storage.delete(&cl.storage_key()).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(removed, error = %e, "stopped deleting change logs");
                    return Err(e);
                }
            }
        }
        Ok(removed)
    }

    // Documents

    pub async fn fetch_document(&self, namespace: &str, collection: &str, id: &str) -> Result<Document> {
        let bytes = self
            .storage
            .get(&document_key(namespace, collection, id))
            .await
            .map_err(|e| match e {
                GatewayError::KeyNotFound { .. } => GatewayError::not_found("document", id),
                other => other,
            })?;
        serde_json::from_slice(&bytes).map_err(|e| GatewayError::serialization("failed to decode document", e))
    }

    /// Documents of a collection in id order, skipping `offset` and returning at most
    /// `limit` (`None` = all).
    pub async fn fetch_documents(
        &self,
        namespace: &str,
        collection: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Document>> {
        let prefix = document_key(namespace, collection, "");
        self.storage
            .get_prefix(&prefix, offset, limit)
            .await?
            .iter()
            .map(|kv| {
                serde_json::from_slice(&kv.value)
                    .map_err(|e| GatewayError::serialization("failed to decode document", e))
            })
            .collect()
    }

    pub async fn store_document(&self, doc: &Document) -> Result<()> {
        let bytes = serde_json::to_vec(doc)?;
        self.storage
            .set(&document_key(&doc.namespace, &doc.collection, &doc.id), bytes)
            .await
    }

    /// Delete one document; a missing document is not an error.
    pub async fn delete_document(&self, namespace: &str, collection: &str, id: &str) -> Result<()> {
        match self.storage.delete(&document_key(namespace, collection, id)).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Delete every document of a collection in one transaction.
    pub async fn delete_documents(&self, namespace: &str, collection: &str) -> Result<()> {
        let prefix = document_key(namespace, collection, "");
        self.storage
            .iterate_txn_prefix(&prefix, &mut |txn, key| txn.delete(key))
            .await
    }

    /// Every stored document in key order.
    pub async fn fetch_all_documents(&self) -> Result<Vec<Document>> {
        self.storage
            .get_prefix(DOCUMENT_PREFIX, 0, None)
            .await?
            .iter()
            .map(|kv| {
                serde_json::from_slice(&kv.value)
                    .map_err(|e| GatewayError::serialization("failed to decode document", e))
            })
            .collect()
    }

    /// Drop every stored document, then store `docs`.
    pub async fn replace_documents(&self, docs: &[Document]) -> Result<()> {
        self.storage
            .iterate_txn_prefix(DOCUMENT_PREFIX, &mut |txn, key| txn.delete(key))
            .await?;
        for doc in docs {
            self.store_document(doc).await?;
        }
        debug!(count = docs.len(), "documents replaced");
        Ok(())
    }

    /// Stop the advertisement task and the replicated log, then close storage.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(replication) = &self.replication {
            replication.shutdown.cancel();
            let task = replication
                .advertiser
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(error = %e, "leader advertisement task failed");
                }
            }
            if let Some(consensus) = replication.consensus.get() {
                consensus.shutdown().await;
            }
        }
        self.storage.close().await?;
        info!("store shut down");
        Ok(())
    }
}

/// Publish this node's [`ServerInfo`] every time it wins leadership for a new term.
async fn advertise_leadership(
    consensus: Arc<dyn Consensus>,
    info: ServerInfo,
    apply_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut rx = consensus.subscribe_leader();
    let mut advertised_term = None;
    let mut last_state = NodeState::FollowerPending;

    loop {
        let state = rx.borrow_and_update().clone();
        let node_state = match (state.role, &state.leader_id) {
            (Role::Leader, _) => NodeState::Leader,
            (Role::Follower, Some(_)) => NodeState::Follower,
            _ => NodeState::FollowerPending,
        };
        if node_state != last_state {
            info!(
                node_id = %info.id,
                leader_id = ?state.leader_id,
                term = state.term,
                state = %node_state,
                "replication state changed"
            );
            last_state = node_state;
        }

        let pending = state.role == Role::Leader && advertised_term != Some(state.term);
        if pending {
            match publish_leader_info(consensus.as_ref(), &info, apply_timeout).await {
                Ok(()) => {
                    info!(node_id = %info.id, term = state.term, admin_advert = %info.admin_advert, "leader info sent");
                    advertised_term = Some(state.term);
                }
                Err(e) => warn!(node_id = %info.id, error = %e, "failed to advertise leadership"),
            }
        }
        let retry = pending && advertised_term != Some(state.term);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(ADVERTISE_RETRY), if retry => {}
        }
    }
    debug!(node_id = %info.id, "leader advertisement task stopped");
}

async fn publish_leader_info(consensus: &dyn Consensus, info: &ServerInfo, timeout: Duration) -> Result<()> {
    let request = ReadRequest::leader_info(info)?;
    consensus
        .submit(Operation::broadcasted(request.to_bytes()?), timeout)
        .await?
        .into_result()
}
