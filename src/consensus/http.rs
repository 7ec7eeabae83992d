//! HTTP transport for replication RPCs.
//!
//! Inbound RPCs are served by a small axum router:
//!
//! | Path                      | Body                       |
//! |---------------------------|----------------------------|
//! | `POST /raft/append-entries`   | [`AppendEntriesRequest`]   |
//! | `POST /raft/request-vote`     | [`RequestVoteRequest`]     |
//! | `POST /raft/install-snapshot` | [`InstallSnapshotRequest`] |
//! | `POST /raft/timeout-now`      | [`TimeoutNowRequest`]      |
//!
//! Once the member registers its [`ClusterAdmin`] the same listener serves cluster
//! administration under `/raft/admin/`:
//!
//! | Path                                   | Body / response                         |
//! |----------------------------------------|-----------------------------------------|
//! | `GET /raft/admin/configuration`        | [`Configuration`]                       |
//! | `GET /raft/admin/leader`               | [`LeaderInfo`]                          |
//! | `GET /raft/admin/stats`                | [`RaftStats`]                           |
//! | `POST /raft/admin/add-voter`           | [`ServerRequest`] with an address       |
//! | `POST /raft/admin/add-nonvoter`        | [`ServerRequest`] with an address       |
//! | `POST /raft/admin/demote-voter`        | [`ServerRequest`]                       |
//! | `POST /raft/admin/remove-server`       | [`ServerRequest`]                       |
//! | `POST /raft/admin/leadership-transfer` | [`TransferRequest`], answers [`LeaderInfo`] |
//!
//! Membership changes answer with the new [`Configuration`] and must be sent to the leader;
//! other members answer 421.
//!
//! When a shared key is configured every request must carry it in
//! [`CLUSTER_KEY_HEADER`]; requests without it are rejected with 401.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{
    AppendEntriesRequest, AppendEntriesResponse, ClusterAdmin, Configuration, ConsensusTransport,
    InstallSnapshotRequest, InstallSnapshotResponse, MembershipChange, NodeId, RaftStats,
    RequestVoteRequest, RequestVoteResponse, RpcHandler, TimeoutNowRequest, TimeoutNowResponse,
};
use crate::config::ReplicationConfig;
use crate::errors::{GatewayError, Result};

/// Header carrying the cluster shared key.
pub const CLUSTER_KEY_HEADER: &str = "x-flowgate-cluster-key";

const APPEND_ENTRIES_PATH: &str = "/raft/append-entries";
const REQUEST_VOTE_PATH: &str = "/raft/request-vote";
const INSTALL_SNAPSHOT_PATH: &str = "/raft/install-snapshot";
const TIMEOUT_NOW_PATH: &str = "/raft/timeout-now";

const ADMIN_CONFIGURATION_PATH: &str = "/raft/admin/configuration";
const ADMIN_LEADER_PATH: &str = "/raft/admin/leader";
const ADMIN_STATS_PATH: &str = "/raft/admin/stats";
const ADMIN_ADD_VOTER_PATH: &str = "/raft/admin/add-voter";
const ADMIN_ADD_NONVOTER_PATH: &str = "/raft/admin/add-nonvoter";
const ADMIN_DEMOTE_VOTER_PATH: &str = "/raft/admin/demote-voter";
const ADMIN_REMOVE_SERVER_PATH: &str = "/raft/admin/remove-server";
const ADMIN_TRANSFER_PATH: &str = "/raft/admin/leadership-transfer";

/// How long an admin request waits for a membership change or handover to finish.
pub const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server named in a membership request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRequest {
    pub id: NodeId,
    /// Replication address; required when adding a server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Voter to hand leadership to; the most up-to-date voter when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub leader_id: Option<NodeId>,
    pub address: Option<String>,
    pub term: u64,
}

impl From<&RaftStats> for LeaderInfo {
    fn from(stats: &RaftStats) -> Self {
        Self {
            address: stats
                .leader_id
                .as_deref()
                .and_then(|id| stats.configuration.address(id))
                .cloned(),
            leader_id: stats.leader_id.clone(),
            term: stats.term,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransportOptions {
    pub bind_address: String,
    pub advert_address: String,
    pub scheme: String,
    pub shared_key: Option<String>,
    pub request_timeout: Duration,
}

impl From<&ReplicationConfig> for HttpTransportOptions {
    fn from(config: &ReplicationConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            advert_address: config.advert_address.clone(),
            scheme: config.advert_scheme.clone(),
            shared_key: config.shared_key.clone(),
            // an RPC outliving an election timeout is useless to the caller
            request_timeout: config.election_timeout(),
        }
    }
}

#[derive(Clone)]
struct ServerState {
    handler: Arc<dyn RpcHandler>,
    admin: Option<Arc<dyn ClusterAdmin>>,
    shared_key: Option<String>,
}

pub struct HttpTransport {
    options: HttpTransportOptions,
    client: reqwest::Client,
    handler: RwLock<Option<Arc<dyn RpcHandler>>>,
    admin: RwLock<Option<Arc<dyn ClusterAdmin>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    server: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl HttpTransport {
    pub fn new(options: HttpTransportOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| GatewayError::config_with_source("failed to build replication client", Box::new(e)))?;
        Ok(Self {
            options,
            client,
            handler: RwLock::new(None),
            admin: RwLock::new(None),
            local_addr: RwLock::new(None),
            server: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the listener actually bound, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn router(state: ServerState) -> Router {
        Router::new()
            .route(APPEND_ENTRIES_PATH, post(append_entries))
            .route(REQUEST_VOTE_PATH, post(request_vote))
            .route(INSTALL_SNAPSHOT_PATH, post(install_snapshot))
            .route(TIMEOUT_NOW_PATH, post(timeout_now))
            .route(ADMIN_CONFIGURATION_PATH, get(admin_configuration))
            .route(ADMIN_LEADER_PATH, get(admin_leader))
            .route(ADMIN_STATS_PATH, get(admin_stats))
            .route(ADMIN_ADD_VOTER_PATH, post(admin_add_voter))
            .route(ADMIN_ADD_NONVOTER_PATH, post(admin_add_nonvoter))
            .route(ADMIN_DEMOTE_VOTER_PATH, post(admin_demote_voter))
            .route(ADMIN_REMOVE_SERVER_PATH, post(admin_remove_server))
            .route(ADMIN_TRANSFER_PATH, post(admin_transfer))
            .with_state(state)
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        target: &str,
        path: &str,
        req: &Req,
    ) -> Result<Resp> {
        let url = format!("{}://{}{}", self.options.scheme, target, path);
        self.send(&url, self.client.post(&url).json(req)).await
    }

    async fn admin_get<Resp: DeserializeOwned>(&self, target: &str, path: &str) -> Result<Resp> {
        let url = format!("{}://{}{}", self.options.scheme, target, path);
        self.send(&url, self.client.get(&url)).await
    }

    async fn admin_post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        target: &str,
        path: &str,
        req: &Req,
    ) -> Result<Resp> {
        let url = format!("{}://{}{}", self.options.scheme, target, path);
        let request = self
            .client
            .post(&url)
            .json(req)
            .timeout(ADMIN_TIMEOUT + self.options.request_timeout);
        self.send(&url, request).await
    }

    async fn send<Resp: DeserializeOwned>(&self, url: &str, mut request: reqwest::RequestBuilder) -> Result<Resp> {
        if let Some(key) = &self.options.shared_key {
            request = request.header(CLUSTER_KEY_HEADER, key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::transport(format!("{} failed: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::transport(format!(
                "{} returned {}: {}",
                url, status, body
            )));
        }
        response
            .json::<Resp>()
            .await
            .map_err(|e| GatewayError::transport(format!("invalid response from {}: {}", url, e)))
    }

    /// Membership as seen by the member at `target`.
    pub async fn fetch_configuration(&self, target: &str) -> Result<Configuration> {
        self.admin_get(target, ADMIN_CONFIGURATION_PATH).await
    }

    pub async fn fetch_leader(&self, target: &str) -> Result<LeaderInfo> {
        self.admin_get(target, ADMIN_LEADER_PATH).await
    }

    pub async fn fetch_stats(&self, target: &str) -> Result<RaftStats> {
        self.admin_get(target, ADMIN_STATS_PATH).await
    }

    /// Ask the leader at `target` to change membership.
    pub async fn request_membership_change(&self, target: &str, change: &MembershipChange) -> Result<Configuration> {
        let (path, body) = match change {
            MembershipChange::AddVoter { id, address } => (ADMIN_ADD_VOTER_PATH, server(id, Some(address))),
            MembershipChange::AddNonvoter { id, address } => (ADMIN_ADD_NONVOTER_PATH, server(id, Some(address))),
            MembershipChange::DemoteVoter { id } => (ADMIN_DEMOTE_VOTER_PATH, server(id, None)),
            MembershipChange::RemoveServer { id } => (ADMIN_REMOVE_SERVER_PATH, server(id, None)),
        };
        self.admin_post(target, path, &body).await
    }

    pub async fn request_leadership_transfer(&self, target: &str, to: Option<NodeId>) -> Result<LeaderInfo> {
        self.admin_post(target, ADMIN_TRANSFER_PATH, &TransferRequest { id: to }).await
    }
}

fn server(id: &str, address: Option<&String>) -> ServerRequest {
    ServerRequest {
        id: id.to_string(),
        address: address.cloned(),
    }
}

type RpcResult<T> = std::result::Result<Json<T>, (StatusCode, String)>;

fn authorize(state: &ServerState, headers: &HeaderMap) -> std::result::Result<(), (StatusCode, String)> {
    let Some(expected) = &state.shared_key else {
        return Ok(());
    };
    match headers.get(CLUSTER_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(key) if key == expected => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, "invalid cluster key".to_string())),
    }
}

fn rpc_error(e: GatewayError) -> (StatusCode, String) {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, e.to_string())
}

async fn append_entries(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<AppendEntriesRequest>,
) -> RpcResult<AppendEntriesResponse> {
    authorize(&state, &headers)?;
    state.handler.append_entries(req).await.map(Json).map_err(rpc_error)
}

async fn request_vote(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<RequestVoteRequest>,
) -> RpcResult<RequestVoteResponse> {
    authorize(&state, &headers)?;
    state.handler.request_vote(req).await.map(Json).map_err(rpc_error)
}

async fn install_snapshot(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<InstallSnapshotRequest>,
) -> RpcResult<InstallSnapshotResponse> {
    authorize(&state, &headers)?;
    state.handler.install_snapshot(req).await.map(Json).map_err(rpc_error)
}

async fn timeout_now(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<TimeoutNowRequest>,
) -> RpcResult<TimeoutNowResponse> {
    authorize(&state, &headers)?;
    state.handler.timeout_now(req).await.map(Json).map_err(rpc_error)
}

fn admin(state: &ServerState, headers: &HeaderMap) -> std::result::Result<Arc<dyn ClusterAdmin>, (StatusCode, String)> {
    authorize(state, headers)?;
    state.admin.clone().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "cluster administration is not available".to_string(),
        )
    })
}

async fn change_membership(
    state: &ServerState,
    headers: &HeaderMap,
    change: MembershipChange,
) -> RpcResult<Configuration> {
    let admin = admin(state, headers)?;
    info!(change = %change, "membership change requested");
    admin
        .change_membership(change, ADMIN_TIMEOUT)
        .await
        .map(Json)
        .map_err(rpc_error)
}

fn address_of(req: ServerRequest) -> std::result::Result<(NodeId, String), (StatusCode, String)> {
    match req.address {
        Some(address) if !address.is_empty() => Ok((req.id, address)),
        _ => Err(rpc_error(GatewayError::validation_field(
            "address is required when adding a server",
            "address",
        ))),
    }
}

async fn admin_configuration(State(state): State<ServerState>, headers: HeaderMap) -> RpcResult<Configuration> {
    Ok(Json(admin(&state, &headers)?.stats().configuration))
}

async fn admin_leader(State(state): State<ServerState>, headers: HeaderMap) -> RpcResult<LeaderInfo> {
    Ok(Json(LeaderInfo::from(&admin(&state, &headers)?.stats())))
}

async fn admin_stats(State(state): State<ServerState>, headers: HeaderMap) -> RpcResult<RaftStats> {
    Ok(Json(admin(&state, &headers)?.stats()))
}

async fn admin_add_voter(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<ServerRequest>,
) -> RpcResult<Configuration> {
    let (id, address) = address_of(req)?;
    change_membership(&state, &headers, MembershipChange::AddVoter { id, address }).await
}

async fn admin_add_nonvoter(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<ServerRequest>,
) -> RpcResult<Configuration> {
    let (id, address) = address_of(req)?;
    change_membership(&state, &headers, MembershipChange::AddNonvoter { id, address }).await
}

async fn admin_demote_voter(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<ServerRequest>,
) -> RpcResult<Configuration> {
    change_membership(&state, &headers, MembershipChange::DemoteVoter { id: req.id }).await
}

async fn admin_remove_server(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<ServerRequest>,
) -> RpcResult<Configuration> {
    change_membership(&state, &headers, MembershipChange::RemoveServer { id: req.id }).await
}

async fn admin_transfer(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(req): Json<TransferRequest>,
) -> RpcResult<LeaderInfo> {
    let admin = admin(&state, &headers)?;
    admin
        .transfer_leadership(req.id, ADMIN_TIMEOUT)
        .await
        .map_err(rpc_error)?;
    Ok(Json(LeaderInfo::from(&admin.stats())))
}

#[async_trait]
impl ConsensusTransport for HttpTransport {
    fn address(&self) -> String {
        self.options.advert_address.clone()
    }

    async fn run(&self) -> Result<()> {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| GatewayError::consensus("no rpc handler registered"))?;

        let listener = TcpListener::bind(&self.options.bind_address).await.map_err(|e| {
            GatewayError::transport(format!(
                "failed to bind replication listener on {}: {}",
                self.options.bind_address, e
            ))
        })?;
        let local = listener.local_addr()?;
        *self.local_addr.write().unwrap_or_else(PoisonError::into_inner) = Some(local);

        let admin = self.admin.read().unwrap_or_else(PoisonError::into_inner).clone();
        let router = Self::router(ServerState {
            handler,
            admin,
            shared_key: self.options.shared_key.clone(),
        });
        let token = self.shutdown.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = result {
                error!(error = %e, "replication listener failed");
            }
        });
        *self.server.lock().unwrap_or_else(PoisonError::into_inner) = Some(server);

        info!(
            bind_address = %local,
            advert_address = %self.options.advert_address,
            authenticated = self.options.shared_key.is_some(),
            "replication transport listening"
        );
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        let server = self.server.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(server) = server {
            let _ = server.await;
            debug!("replication transport stopped");
        }
    }

    fn register_handler(&self, handler: Arc<dyn RpcHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn register_admin(&self, admin: Arc<dyn ClusterAdmin>) {
        *self.admin.write().unwrap_or_else(PoisonError::into_inner) = Some(admin);
    }

    async fn send_append_entries(
        &self,
        target: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.call(target, APPEND_ENTRIES_PATH, &req).await
    }

    async fn send_request_vote(
        &self,
        target: &str,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.call(target, REQUEST_VOTE_PATH, &req).await
    }

    async fn send_install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.call(target, INSTALL_SNAPSHOT_PATH, &req).await
    }

    async fn send_timeout_now(&self, target: &str, req: TimeoutNowRequest) -> Result<TimeoutNowResponse> {
        self.call(target, TIMEOUT_NOW_PATH, &req).await
    }
}
