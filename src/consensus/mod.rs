//! # Consensus Contract
//!
//! The replicated store depends on a leader-based replicated log through the traits in
//! this module:
//!
//! - [`Consensus`]: submit operations, observe leadership, bootstrap and change membership
//! - [`StateMachine`]: applies committed operations on every node
//! - [`ConsensusTransport`]: carries the replication RPCs between members
//! - [`RpcHandler`]: receives those RPCs on the local node
//! - [`ClusterAdmin`]: membership and leadership administration served next to the RPCs
//!
//! [`ReplicatedLog`] is the in-tree implementation; it keeps its term, vote, log and
//! snapshot in a [`LogStore`]. [`MemoryTransport`] connects nodes in one process and
//! [`HttpTransport`] connects nodes over HTTP.

pub mod http;
pub mod log_store;
pub mod node;
pub mod transport;

pub use http::HttpTransport;
pub use log_store::LogStore;
pub use node::{RaftOptions, ReplicatedLog};
pub use transport::{MemoryNetwork, MemoryTransport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::errors::{GatewayError, Result};

/// Member identifier.
pub type NodeId = String;

/// How the state machine should treat an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A state mutation (a change log)
    Replicated,
    /// Cluster metadata every member should observe (leader advertisement)
    Broadcasted,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Replicated => f.write_str("replicated"),
            OperationType::Broadcasted => f.write_str("broadcasted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub op_type: OperationType,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Operation {
    pub fn replicated(data: Vec<u8>) -> Self {
        Self {
            op_type: OperationType::Replicated,
            data,
        }
    }

    pub fn broadcasted(data: Vec<u8>) -> Self {
        Self {
            op_type: OperationType::Broadcasted,
            data,
        }
    }
}

/// Application response produced by [`StateMachine::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApplyResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }

    /// Convert into a `Result`, mapping a failed response to a state error.
    pub fn into_result(self) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(GatewayError::state(
                self.error
                    .unwrap_or_else(|| "state machine rejected the operation".to_string()),
            ))
        }
    }
}

/// Role of the local member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Shutdown => "shutdown",
        })
    }
}

/// Leadership as observed by the local member, published on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderState {
    pub leader_id: Option<NodeId>,
    pub term: u64,
    pub role: Role,
}

impl Default for LeaderState {
    fn default() -> Self {
        Self {
            leader_id: None,
            term: 0,
            role: Role::Follower,
        }
    }
}

/// Cluster membership: voting members and non-voting learners, id to replication address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Voting members
    pub members: BTreeMap<NodeId, String>,
    /// Members that receive the log but do not vote
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub learners: BTreeMap<NodeId, String>,
}

impl Configuration {
    pub fn new(members: BTreeMap<NodeId, String>) -> Self {
        Self {
            members,
            learners: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.learners.is_empty()
    }

    /// Whether `id` is a voter.
    pub fn contains(&self, id: &str) -> bool {
        self.members.contains_key(id)
    }

    /// Whether `id` is a voter or a learner.
    pub fn is_member(&self, id: &str) -> bool {
        self.members.contains_key(id) || self.learners.contains_key(id)
    }

    pub fn address(&self, id: &str) -> Option<&String> {
        self.members.get(id).or_else(|| self.learners.get(id))
    }

    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Voters and learners other than `id`, with their addresses.
    pub fn peers<'a>(&'a self, id: &'a str) -> impl Iterator<Item = (&'a NodeId, &'a String)> + 'a {
        self.members
            .iter()
            .chain(self.learners.iter())
            .filter(move |(member, _)| member.as_str() != id)
    }

    /// Voters other than `id`.
    pub fn voters<'a>(&'a self, id: &'a str) -> impl Iterator<Item = (&'a NodeId, &'a String)> + 'a {
        self.members.iter().filter(move |(member, _)| member.as_str() != id)
    }

    /// The configuration that results from `change`.
    pub fn apply(&self, change: &MembershipChange) -> Result<Configuration> {
        let mut next = self.clone();
        match change {
            MembershipChange::AddVoter { id, address } => {
                next.learners.remove(id);
                next.members.insert(id.clone(), address.clone());
            }
            MembershipChange::AddNonvoter { id, address } => match next.members.get_mut(id) {
                Some(existing) => *existing = address.clone(),
                None => {
                    next.learners.insert(id.clone(), address.clone());
                }
            },
            MembershipChange::DemoteVoter { id } => {
                let address = next
                    .members
                    .remove(id)
                    .ok_or_else(|| GatewayError::not_found("voter", id.as_str()))?;
                next.learners.insert(id.clone(), address);
            }
            MembershipChange::RemoveServer { id } => {
                if next.members.remove(id).is_none() && next.learners.remove(id).is_none() {
                    return Err(GatewayError::not_found("server", id.as_str()));
                }
            }
        }
        if next.members.is_empty() {
            return Err(GatewayError::validation("configuration must keep at least one voter"));
        }
        Ok(next)
    }
}

/// A single-server membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum MembershipChange {
    AddVoter { id: NodeId, address: String },
    AddNonvoter { id: NodeId, address: String },
    DemoteVoter { id: NodeId },
    RemoveServer { id: NodeId },
}

impl fmt::Display for MembershipChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipChange::AddVoter { id, .. } => write!(f, "add voter {}", id),
            MembershipChange::AddNonvoter { id, .. } => write!(f, "add nonvoter {}", id),
            MembershipChange::DemoteVoter { id } => write!(f, "demote voter {}", id),
            MembershipChange::RemoveServer { id } => write!(f, "remove server {}", id),
        }
    }
}

/// Point-in-time view of a member's replication state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStats {
    pub id: NodeId,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub snapshot_index: u64,
    /// Index of the entry carrying the current configuration (0 when bootstrapped)
    pub configuration_index: u64,
    pub configuration: Configuration,
}

/// Payload of a replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPayload {
    /// Appended by a new leader; carries the membership so followers learn it
    Configuration(Configuration),
    Operation(Operation),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: EntryPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Follower's last log index, used by the leader to rewind `next_index`
    pub last_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub configuration: Configuration,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// Sent by a leader handing leadership to an up-to-date voter: campaign immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub term: u64,
    pub leader_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    pub term: u64,
}

/// Receives replication RPCs on the local member.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse>;

    async fn install_snapshot(&self, req: InstallSnapshotRequest)
        -> Result<InstallSnapshotResponse>;

    async fn timeout_now(&self, req: TimeoutNowRequest) -> Result<TimeoutNowResponse>;
}

/// Membership and leadership administration of the local member.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Commit a membership change through the log; leader only.
    async fn change_membership(&self, change: MembershipChange, timeout: Duration) -> Result<Configuration>;

    /// Hand leadership to `target`, or to the most up-to-date voter; leader only.
    async fn transfer_leadership(&self, target: Option<NodeId>, timeout: Duration) -> Result<NodeId>;

    fn stats(&self) -> RaftStats;
}

/// Carries replication RPCs between members. Targets are replication addresses.
#[async_trait]
pub trait ConsensusTransport: Send + Sync {
    /// Address peers use to reach this member.
    fn address(&self) -> String;

    /// Start accepting inbound RPCs. Returns once the transport is ready.
    async fn run(&self) -> Result<()>;

    async fn shutdown(&self);

    fn register_handler(&self, handler: Arc<dyn RpcHandler>);

    /// Serve cluster administration next to the RPCs, where the transport supports it.
    fn register_admin(&self, _admin: Arc<dyn ClusterAdmin>) {}

    async fn send_append_entries(
        &self,
        target: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn send_request_vote(
        &self,
        target: &str,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn send_install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    async fn send_timeout_now(&self, target: &str, req: TimeoutNowRequest) -> Result<TimeoutNowResponse>;

    fn encode_configuration(&self, config: &Configuration) -> Result<Vec<u8>> {
        serde_json::to_vec(config)
            .map_err(|e| GatewayError::serialization("failed to encode configuration", e))
    }

    fn decode_configuration(&self, bytes: &[u8]) -> Result<Configuration> {
        serde_json::from_slice(bytes)
            .map_err(|e| GatewayError::serialization("failed to decode configuration", e))
    }
}

/// Applies committed operations. Called for every committed operation, in log order.
#[async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&self, index: u64, op: &Operation) -> ApplyResponse;

    async fn snapshot(&self) -> Result<Vec<u8>>;

    async fn restore(&self, data: &[u8]) -> Result<()>;

    /// Whether `log_size` entries since the last snapshot warrant a new one.
    fn need_snapshot(&self, log_size: u64) -> bool;

    /// Last log index whose effects survived a restart. Entries up to it are not
    /// applied again.
    async fn recover(&self) -> Result<u64> {
        Ok(0)
    }
}

/// A replicated log as seen by the store.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Start timers and the transport.
    async fn start(&self) -> Result<()>;

    /// Submit an operation on the leader and wait up to `timeout` for it to be applied.
    async fn submit(&self, op: Operation, timeout: Duration) -> Result<ApplyResponse>;

    fn id(&self) -> NodeId;

    fn leader_id(&self) -> Option<NodeId>;

    fn is_leader(&self) -> bool;

    fn role(&self) -> Role;

    /// Install an initial membership. Fails when a membership already exists.
    async fn bootstrap(&self, config: Configuration) -> Result<()>;

    fn configuration(&self) -> Configuration;

    /// Add, demote or remove a member; leader only. Returns the committed configuration.
    async fn change_membership(&self, change: MembershipChange, timeout: Duration) -> Result<Configuration>;

    /// Hand leadership to another voter; leader only. Returns the new leader's id.
    async fn transfer_leadership(&self, target: Option<NodeId>, timeout: Duration) -> Result<NodeId>;

    fn stats(&self) -> RaftStats;

    fn subscribe_leader(&self) -> watch::Receiver<LeaderState>;

    async fn shutdown(&self);
}

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_quorum_and_peers() {
        let mut members = BTreeMap::new();
        members.insert("a".to_string(), "10.0.0.1:9090".to_string());
        members.insert("b".to_string(), "10.0.0.2:9090".to_string());
        members.insert("c".to_string(), "10.0.0.3:9090".to_string());
        let config = Configuration::new(members);
        assert_eq!(config.quorum(), 2);
        let peers: Vec<_> = config.peers("a").map(|(id, _)| id.as_str()).collect();
        assert_eq!(peers, vec!["b", "c"]);
    }

    #[test]
    fn test_operation_wire_form() {
        let op = Operation::broadcasted(b"{\"key\":\"leaderInfo\"}".to_vec());
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op_type"], "broadcasted");
        assert!(json["data"].is_string());
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_apply_response_into_result() {
        assert!(ApplyResponse::ok().into_result().is_ok());
        let err = ApplyResponse::failed("service not found: svc")
            .into_result()
            .unwrap_err();
        assert!(matches!(err, GatewayError::State { .. }));
        assert_eq!(err.status_code(), 422);
        assert!(err.to_string().contains("service not found: svc"));
    }

    fn three_voters() -> Configuration {
        let mut members = BTreeMap::new();
        members.insert("a".to_string(), "10.0.0.1:9090".to_string());
        members.insert("b".to_string(), "10.0.0.2:9090".to_string());
        members.insert("c".to_string(), "10.0.0.3:9090".to_string());
        Configuration::new(members)
    }

    #[test]
    fn test_membership_changes() {
        let config = three_voters();
        let added = config
            .apply(&MembershipChange::AddNonvoter {
                id: "d".to_string(),
                address: "10.0.0.4:9090".to_string(),
            })
            .unwrap();
        assert!(added.is_member("d"));
        assert!(!added.contains("d"));
        assert_eq!(added.quorum(), 2);
        assert_eq!(added.peers("a").count(), 3);
        assert_eq!(added.voters("a").count(), 2);

        let promoted = added
            .apply(&MembershipChange::AddVoter {
                id: "d".to_string(),
                address: "10.0.0.4:9090".to_string(),
            })
            .unwrap();
        assert!(promoted.contains("d"));
        assert!(promoted.learners.is_empty());
        assert_eq!(promoted.quorum(), 3);

        let demoted = promoted
            .apply(&MembershipChange::DemoteVoter { id: "a".to_string() })
            .unwrap();
        assert!(!demoted.contains("a"));
        assert_eq!(demoted.address("a").map(String::as_str), Some("10.0.0.1:9090"));

        let removed = demoted
            .apply(&MembershipChange::RemoveServer { id: "a".to_string() })
            .unwrap();
        assert!(!removed.is_member("a"));
        assert!(removed
            .apply(&MembershipChange::RemoveServer { id: "a".to_string() })
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_last_voter_cannot_leave() {
        let mut members = BTreeMap::new();
        members.insert("a".to_string(), "10.0.0.1:9090".to_string());
        let config = Configuration::new(members);
        assert!(config
            .apply(&MembershipChange::DemoteVoter { id: "a".to_string() })
            .is_err());
        assert!(config
            .apply(&MembershipChange::RemoveServer { id: "a".to_string() })
            .is_err());
    }

    #[test]
    fn test_configuration_without_learners_keeps_wire_form() {
        let json = serde_json::to_value(three_voters()).unwrap();
        assert!(json.get("learners").is_none());
        let back: Configuration = serde_json::from_value(json).unwrap();
        assert_eq!(back, three_voters());
    }
}
