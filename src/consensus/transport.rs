//! In-process transport.
//!
//! A [`MemoryNetwork`] maps replication addresses to registered handlers. Each member owns a
//! [`MemoryTransport`] bound to one address. Tests can cut a member off with
//! [`MemoryNetwork::disconnect`] to simulate a partition.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, RwLock};

use super::{
    AppendEntriesRequest, AppendEntriesResponse, ConsensusTransport, InstallSnapshotRequest,
    InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse, RpcHandler, TimeoutNowRequest,
    TimeoutNowResponse,
};
use crate::errors::{GatewayError, Result};

#[derive(Default)]
pub struct MemoryNetwork {
    handlers: DashMap<String, Arc<dyn RpcHandler>>,
    disconnected: DashSet<String>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport bound to `address` on this network.
    pub fn transport(self: &Arc<Self>, address: impl Into<String>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            address: address.into(),
            network: Arc::clone(self),
            handler: RwLock::new(None),
        })
    }

    /// Drop all traffic to and from `address`.
    pub fn disconnect(&self, address: &str) {
        self.disconnected.insert(address.to_string());
    }

    pub fn reconnect(&self, address: &str) {
        self.disconnected.remove(address);
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<dyn RpcHandler>> {
        if self.disconnected.contains(from) || self.disconnected.contains(to) {
            return Err(GatewayError::transport(format!(
                "{} is unreachable from {}",
                to, from
            )));
        }
        self.handlers
            .get(to)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::transport(format!("no member listening on {}", to)))
    }
}

pub struct MemoryTransport {
    address: String,
    network: Arc<MemoryNetwork>,
    handler: RwLock<Option<Arc<dyn RpcHandler>>>,
}

#[async_trait]
impl ConsensusTransport for MemoryTransport {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn run(&self) -> Result<()> {
        let handler = self
            .handler
            .read()
            .map_err(|_| GatewayError::internal("transport handler lock poisoned"))?
            .clone()
            .ok_or_else(|| GatewayError::consensus("no rpc handler registered"))?;
        self.network.handlers.insert(self.address.clone(), handler);
        Ok(())
    }

    async fn shutdown(&self) {
        self.network.handlers.remove(&self.address);
        if let Ok(mut handler) = self.handler.write() {
            handler.take();
        }
    }

    fn register_handler(&self, handler: Arc<dyn RpcHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }

    async fn send_append_entries(
        &self,
        target: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.network
            .route(&self.address, target)?
            .append_entries(req)
            .await
    }

    async fn send_request_vote(
        &self,
        target: &str,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.network
            .route(&self.address, target)?
            .request_vote(req)
            .await
    }

    async fn send_install_snapshot(
        &self,
        target: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.network
            .route(&self.address, target)?
            .install_snapshot(req)
            .await
    }

    async fn send_timeout_now(&self, target: &str, req: TimeoutNowRequest) -> Result<TimeoutNowResponse> {
        self.network
            .route(&self.address, target)?
            .timeout_now(req)
            .await
    }
}
