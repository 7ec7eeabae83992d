//! # Replicated Log
//!
//! A leader-based replicated log in the style of Raft:
//!
//! - members campaign for leadership after an election timeout without hearing from a leader
//! - the leader appends submitted operations and replicates them with append-entries RPCs
//! - an entry commits once a majority of voters hold it durably, and committed entries are
//!   applied to the [`StateMachine`] strictly in index order by a single applier task
//! - membership lives in configuration entries; a new leader appends one so followers learn
//!   the membership, and single-server changes take effect as soon as they are appended
//! - once the state machine asks for it the applied prefix is compacted into a snapshot, and
//!   followers that fall behind the compacted prefix receive it with install-snapshot
//!
//! Term, vote, log and snapshot are written to a [`LogStore`] before any RPC is answered
//! or any vote is counted, so a restarted member neither votes twice in a term nor forgets
//! entries it acknowledged.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::log_store::{HardState, LogStore, SnapshotRecord};
use super::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyResponse, ClusterAdmin, Configuration,
    Consensus, ConsensusTransport, EntryPayload, InstallSnapshotRequest, InstallSnapshotResponse,
    LeaderState, LogEntry, MembershipChange, NodeId, Operation, RaftStats, RequestVoteRequest,
    RequestVoteResponse, Role, RpcHandler, StateMachine, TimeoutNowRequest, TimeoutNowResponse,
};
use crate::config::ReplicationConfig;
use crate::errors::{GatewayError, Result};
use crate::raft_span;
use crate::storage::Storage;

/// Upper bound on entries carried by one append-entries RPC.
const MAX_APPEND_ENTRIES: usize = 256;

/// Replication timing.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Base election timeout; each member waits a random duration in `[t, 2t)`
    pub election_timeout: Duration,
    /// Interval between leader heartbeats
    pub heartbeat: Duration,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(1_000),
            heartbeat: Duration::from_millis(100),
        }
    }
}

impl From<&ReplicationConfig> for RaftOptions {
    fn from(config: &ReplicationConfig) -> Self {
        Self {
            election_timeout: config.election_timeout(),
            heartbeat: config.heartbeat(),
        }
    }
}

struct Pending {
    term: u64,
    tx: oneshot::Sender<ApplyResponse>,
}

/// A change the log store has not seen yet.
enum Unsaved {
    HardState,
    Append(LogEntry),
    Truncate(u64),
    Snapshot { record: SnapshotRecord, discard_log: bool },
}

struct RaftState {
    role: Role,
    current_term: u64,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,

    /// Membership in effect: the newest configuration entry, else the snapshot's, else the
    /// bootstrap membership
    configuration: Configuration,
    configuration_index: u64,
    bootstrap_configuration: Configuration,
    snapshot_configuration: Configuration,

    /// Entries after the snapshot; `log[0].index == snapshot_index + 1`
    log: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
    snapshot: Option<Vec<u8>>,

    commit_index: u64,
    last_applied: u64,

    /// Every entry up to here is in the log store
    durable_index: u64,
    /// Bumped by every truncation so an in-flight flush cannot overstate `durable_index`
    truncations: u64,
    unsaved: Vec<Unsaved>,

    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    pending: HashMap<u64, Pending>,

    last_contact: Instant,
    last_heartbeat: Instant,
    election_deadline: Duration,
}

impl RaftState {
    fn new(election_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            configuration: Configuration::default(),
            configuration_index: 0,
            bootstrap_configuration: Configuration::default(),
            snapshot_configuration: Configuration::default(),
            log: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
            snapshot: None,
            commit_index: 0,
            last_applied: 0,
            durable_index: 0,
            truncations: 0,
            unsaved: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            pending: HashMap::new(),
            last_contact: now,
            last_heartbeat: now,
            election_deadline: random_deadline(election_timeout),
        }
    }

    fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            bootstrap: self.bootstrap_configuration.clone(),
        }
    }

    fn last_index(&self) -> u64 {
        self.log.last().map_or(self.snapshot_index, |e| e.index)
    }

    fn last_term(&self) -> u64 {
        self.log.last().map_or(self.snapshot_term, |e| e.term)
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.log.get((index - self.snapshot_index - 1) as usize)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Entries starting at `index` (which must be past the snapshot).
    fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        let start = ((index - self.snapshot_index - 1) as usize).min(self.log.len());
        let end = (start + MAX_APPEND_ENTRIES).min(self.log.len());
        self.log[start..end].to_vec()
    }

    fn set_term(&mut self, term: u64) {
        self.current_term = term;
        self.voted_for = None;
        self.unsaved.push(Unsaved::HardState);
    }

    fn append(&mut self, entry: LogEntry) {
        if let EntryPayload::Configuration(config) = &entry.payload {
            self.configuration = config.clone();
            self.configuration_index = entry.index;
        }
        self.unsaved.push(Unsaved::Append(entry.clone()));
        self.log.push(entry);
    }

    /// Remove `index` and everything after it.
    fn truncate_from(&mut self, index: u64) {
        if index <= self.snapshot_index || index > self.last_index() {
            return;
        }
        self.log.truncate((index - self.snapshot_index - 1) as usize);
        self.unsaved.push(Unsaved::Truncate(index));
        self.truncations += 1;
        self.durable_index = self.durable_index.min(index - 1);
        self.refresh_configuration();
    }

    /// Membership as of `index`.
    fn configuration_at(&self, index: u64) -> (Configuration, u64) {
        let from_log = self.log.iter().rev().find_map(|e| match &e.payload {
            EntryPayload::Configuration(config) if e.index <= index => Some((config.clone(), e.index)),
            _ => None,
        });
        match from_log {
            Some(found) => found,
            None if self.snapshot_index > 0 => (self.snapshot_configuration.clone(), self.snapshot_index),
            None => (self.bootstrap_configuration.clone(), 0),
        }
    }

    fn refresh_configuration(&mut self) {
        let (configuration, index) = self.configuration_at(u64::MAX);
        self.configuration = configuration;
        self.configuration_index = index;
    }

    /// Drop entries up to and including `index`.
    fn compact_to(&mut self, index: u64, term: u64, configuration: Configuration) {
        self.log.retain(|e| e.index > index);
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.snapshot_configuration = configuration;
    }

    fn leader_state(&self) -> LeaderState {
        LeaderState {
            leader_id: self.leader_id.clone(),
            term: self.current_term,
            role: self.role,
        }
    }

    fn step_down(&mut self) {
        if self.role == Role::Leader {
            // waiters observe a closed channel and report lost leadership
            self.pending.clear();
        }
        self.role = Role::Follower;
    }

    fn check_leader(&self) -> Result<()> {
        match self.role {
            Role::Leader => Ok(()),
            Role::Shutdown => Err(GatewayError::consensus("member is shut down")),
            Role::Follower | Role::Candidate => Err(GatewayError::NotLeader),
        }
    }
}

fn random_deadline(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(base_ms..base_ms * 2))
}

fn timed_out(timeout: Duration) -> GatewayError {
    GatewayError::ApplyTimeout {
        duration_ms: timeout.as_millis() as u64,
    }
}

enum Outbound {
    Append { req: AppendEntriesRequest, last: u64 },
    Snapshot(InstallSnapshotRequest),
}

struct Shared {
    id: NodeId,
    options: RaftOptions,
    transport: Arc<dyn ConsensusTransport>,
    fsm: Arc<dyn StateMachine>,
    log_store: LogStore,
    state: Mutex<RaftState>,
    leader_tx: watch::Sender<LeaderState>,
    apply_notify: Notify,
    campaign_now: Notify,
    apply_lock: tokio::sync::Mutex<()>,
    io_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, st: &RaftState) {
        let next = st.leader_state();
        self.leader_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Write unsaved changes to the log store in the order they were made, then let
    /// commit and apply catch up with what is now durable.
    async fn flush(&self) -> Result<()> {
        let _io = self.io_lock.lock().await;
        let (ops, hard_state, last, truncations) = {
            let mut st = self.lock();
            (
                std::mem::take(&mut st.unsaved),
                st.hard_state(),
                st.last_index(),
                st.truncations,
            )
        };
        if let Err(e) = self.write(&ops, &hard_state).await {
            let mut st = self.lock();
            let newer = std::mem::replace(&mut st.unsaved, ops);
            st.unsaved.extend(newer);
            warn!(node_id = %self.id, error = %e, "failed to persist replication state");
            return Err(e);
        }

        let mut st = self.lock();
        if st.truncations == truncations {
            st.durable_index = last;
        }
        self.advance_commit(&mut st);
        self.apply_notify.notify_one();
        Ok(())
    }

    async fn write(&self, ops: &[Unsaved], hard_state: &HardState) -> Result<()> {
        let mut hard_state_changed = false;
        for op in ops {
            match op {
                Unsaved::HardState => hard_state_changed = true,
                Unsaved::Append(entry) => self.log_store.append(std::slice::from_ref(entry)).await?,
                Unsaved::Truncate(index) => self.log_store.truncate_from(*index).await?,
                Unsaved::Snapshot { record, discard_log } => {
                    self.log_store.save_snapshot(record, *discard_log).await?
                }
            }
        }
        if hard_state_changed {
            self.log_store.save_hard_state(hard_state).await?;
        }
        Ok(())
    }

    /// Record a valid leader for `term`, stepping down when needed.
    fn observe_leader(&self, st: &mut RaftState, term: u64, leader: &str) {
        if term > st.current_term {
            st.set_term(term);
        }
        if st.role != Role::Follower {
            st.step_down();
        }
        if st.leader_id.as_deref() != Some(leader) {
            info!(node_id = %self.id, leader_id = %leader, term, "following new leader");
            st.leader_id = Some(leader.to_string());
        }
        self.publish(st);
    }

    fn observe_term(&self, st: &mut RaftState, term: u64) {
        if term > st.current_term {
            st.set_term(term);
            st.leader_id = None;
            st.step_down();
            self.publish(st);
        }
    }

    fn become_leader(&self, st: &mut RaftState) {
        st.role = Role::Leader;
        st.leader_id = Some(self.id.clone());
        let next = st.last_index() + 1;
        let peers: Vec<NodeId> = st.configuration.peers(&self.id).map(|(id, _)| id.clone()).collect();
        st.next_index = peers.iter().map(|id| (id.clone(), next)).collect();
        st.match_index = peers.into_iter().map(|id| (id, 0)).collect();

        let entry = LogEntry {
            index: next,
            term: st.current_term,
            payload: EntryPayload::Configuration(st.configuration.clone()),
        };
        st.append(entry);
        info!(node_id = %self.id, term = st.current_term, "became leader");
        self.publish(st);
    }

    fn advance_commit(&self, st: &mut RaftState) {
        if st.role != Role::Leader {
            return;
        }
        let quorum = st.configuration.quorum();
        let mut n = st.last_index();
        while n > st.commit_index {
            if st.term_at(n) == Some(st.current_term) {
                let own = usize::from(st.configuration.contains(&self.id) && st.durable_index >= n);
                let acks = own
                    + st
                        .configuration
                        .voters(&self.id)
                        .filter(|(id, _)| st.match_index.get(*id).copied().unwrap_or(0) >= n)
                        .count();
                if acks >= quorum {
                    debug!(node_id = %self.id, commit_index = n, "commit index advanced");
                    st.commit_index = n;
                    self.apply_notify.notify_one();
                    return;
                }
            }
            n -= 1;
        }
    }

    fn replicate_all(self: &Arc<Self>) {
        let peers: Vec<(NodeId, String)> = {
            let mut st = self.lock();
            if st.role != Role::Leader {
                return;
            }
            st.last_heartbeat = Instant::now();
            st.configuration
                .peers(&self.id)
                .map(|(id, addr)| (id.clone(), addr.clone()))
                .collect()
        };
        for (peer, address) in peers {
            let shared = Arc::clone(self);
            tokio::spawn(async move { shared.replicate_to(peer, address).await });
        }
    }

    async fn replicate_to(self: Arc<Self>, peer: NodeId, address: String) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let (term, outbound) = {
            let st = self.lock();
            if st.role != Role::Leader {
                return;
            }
            let next = st
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or(st.last_index() + 1);
            let outbound = if next <= st.snapshot_index {
                let Some(data) = st.snapshot.clone() else {
                    return;
                };
                Outbound::Snapshot(InstallSnapshotRequest {
                    term: st.current_term,
                    leader_id: self.id.clone(),
                    last_included_index: st.snapshot_index,
                    last_included_term: st.snapshot_term,
                    configuration: st.snapshot_configuration.clone(),
                    data,
                })
            } else {
                let prev_log_index = next - 1;
                let entries = st.entries_from(next);
                let last = prev_log_index + entries.len() as u64;
                Outbound::Append {
                    req: AppendEntriesRequest {
                        term: st.current_term,
                        leader_id: self.id.clone(),
                        prev_log_index,
                        prev_log_term: st.term_at(prev_log_index).unwrap_or(0),
                        entries,
                        leader_commit: st.commit_index,
                    },
                    last,
                }
            };
            (st.current_term, outbound)
        };

        match outbound {
            Outbound::Append { req, last } => {
                match self.transport.send_append_entries(&address, req).await {
                    Ok(resp) => self.on_append_response(&peer, &address, term, last, resp),
                    Err(e) => debug!(node_id = %self.id, peer = %peer, error = %e, "append entries failed"),
                }
            }
            Outbound::Snapshot(req) => {
                let last_included = req.last_included_index;
                info!(node_id = %self.id, peer = %peer, last_included, "sending snapshot");
                match self.transport.send_install_snapshot(&address, req).await {
                    Ok(resp) => {
                        let mut st = self.lock();
                        self.observe_term(&mut st, resp.term);
                        if st.role == Role::Leader && st.current_term == term {
                            let matched = st.match_index.entry(peer.clone()).or_insert(0);
                            *matched = (*matched).max(last_included);
                            let matched = *matched;
                            st.next_index.insert(peer, matched + 1);
                            self.advance_commit(&mut st);
                        }
                    }
                    Err(e) => warn!(node_id = %self.id, peer = %peer, error = %e, "install snapshot failed"),
                }
            }
        }
    }

    fn on_append_response(
        self: &Arc<Self>,
        peer: &str,
        address: &str,
        term: u64,
        last: u64,
        resp: AppendEntriesResponse,
    ) {
        let retry = {
            let mut st = self.lock();
            self.observe_term(&mut st, resp.term);
            if st.role != Role::Leader || st.current_term != term {
                return;
            }
            if resp.success {
                let matched = st.match_index.entry(peer.to_string()).or_insert(0);
                *matched = (*matched).max(last);
                let matched = *matched;
                let next = st.next_index.entry(peer.to_string()).or_insert(matched + 1);
                *next = (*next).max(matched + 1);
                self.advance_commit(&mut st);
                // more entries may have been appended while this batch was in flight
                st.last_index() > matched
            } else {
                let next = st.next_index.entry(peer.to_string()).or_insert(1);
                *next = next.saturating_sub(1).min(resp.last_index + 1).max(1);
                true
            }
        };
        if retry {
            let shared = Arc::clone(self);
            let peer = peer.to_string();
            let address = address.to_string();
            tokio::spawn(async move { shared.replicate_to(peer, address).await });
        }
    }

    async fn campaign(self: &Arc<Self>) {
        let (term, req, voters) = {
            let mut st = self.lock();
            if matches!(st.role, Role::Leader | Role::Shutdown) || !st.configuration.contains(&self.id) {
                return;
            }
            st.role = Role::Candidate;
            let term = st.current_term + 1;
            st.set_term(term);
            st.voted_for = Some(self.id.clone());
            st.leader_id = None;
            st.last_contact = Instant::now();
            st.election_deadline = random_deadline(self.options.election_timeout);
            self.publish(&st);

            let req = RequestVoteRequest {
                term,
                candidate_id: self.id.clone(),
                last_log_index: st.last_index(),
                last_log_term: st.last_term(),
            };
            let voters: Vec<String> = st.configuration.voters(&self.id).map(|(_, a)| a.clone()).collect();
            (term, req, voters)
        };
        // the self vote counts only once it is durable
        if let Err(e) = self.flush().await {
            warn!(node_id = %self.id, term, error = %e, "abandoning election");
            return;
        }

        info!(node_id = %self.id, term, "starting election");
        let ballots = futures::future::join_all(voters.iter().map(|address| {
            tokio::time::timeout(
                self.options.election_timeout,
                self.transport.send_request_vote(address, req.clone()),
            )
        }))
        .await;

        let won = {
            let mut st = self.lock();
            let mut granted = 1;
            for ballot in ballots {
                if let Ok(Ok(resp)) = ballot {
                    self.observe_term(&mut st, resp.term);
                    if resp.vote_granted && resp.term == term {
                        granted += 1;
                    }
                }
            }
            if st.role == Role::Candidate && st.current_term == term && granted >= st.configuration.quorum() {
                self.become_leader(&mut st);
                true
            } else {
                debug!(node_id = %self.id, term, granted, "election not won");
                false
            }
        };
        if won {
            self.replicate_all();
            if let Err(e) = self.flush().await {
                warn!(node_id = %self.id, term, error = %e, "leader could not persist its first entry");
            }
        }
    }

    async fn run_timers(self: Arc<Self>) {
        let tick = (self.options.heartbeat / 2).max(Duration::from_millis(5));
        let mut interval = tokio::time::interval(tick);
        loop {
            let forced = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.campaign_now.notified() => true,
                _ = interval.tick() => false,
            };
            if forced {
                self.campaign().await;
                continue;
            }

            let (heartbeat, campaign, dirty) = {
                let st = self.lock();
                let dirty = !st.unsaved.is_empty();
                match st.role {
                    Role::Leader => (st.last_heartbeat.elapsed() >= self.options.heartbeat, false, dirty),
                    Role::Follower | Role::Candidate => (
                        false,
                        st.configuration.contains(&self.id)
                            && st.last_contact.elapsed() >= st.election_deadline,
                        dirty,
                    ),
                    Role::Shutdown => break,
                }
            };
            if dirty {
                if let Err(e) = self.flush().await {
                    debug!(node_id = %self.id, error = %e, "deferred flush failed");
                }
            }
            if heartbeat {
                self.replicate_all();
            } else if campaign {
                self.campaign().await;
            }
        }
    }

    async fn run_applier(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.apply_notify.notified() => {}
            }
            self.apply_committed().await;
        }
    }

    async fn apply_committed(&self) {
        let _guard = self.apply_lock.lock().await;
        loop {
            let entry = {
                let st = self.lock();
                if st.last_applied >= st.commit_index.min(st.durable_index) {
                    break;
                }
                match st.entry(st.last_applied + 1) {
                    Some(entry) => entry.clone(),
                    None => break,
                }
            };

            let response = match &entry.payload {
                EntryPayload::Operation(op) => {
                    self.fsm
                        .apply(entry.index, op)
                        .instrument(raft_span!("apply", self.id, index = entry.index))
                        .await
                }
                EntryPayload::Configuration(_) => ApplyResponse::ok(),
            };

            let snapshot_due = {
                let mut st = self.lock();
                st.last_applied = entry.index;
                if let Some(pending) = st.pending.remove(&entry.index) {
                    if pending.term == entry.term {
                        let _ = pending.tx.send(response);
                    }
                }
                let removed = matches!(entry.payload, EntryPayload::Configuration(_))
                    && entry.index >= st.configuration_index
                    && !st.configuration.contains(&self.id);
                if removed && st.role == Role::Leader {
                    info!(node_id = %self.id, index = entry.index, "no longer a voter, stepping down");
                    st.step_down();
                    st.leader_id = None;
                    self.publish(&st);
                }
                self.fsm.need_snapshot(st.last_applied - st.snapshot_index)
            };
            if snapshot_due {
                self.take_snapshot().await;
            }
        }
    }

    /// Compact the applied prefix. Called with the apply lock held.
    async fn take_snapshot(&self) {
        let data = match self.fsm.snapshot().await {
            Ok(data) => data,
            Err(e) => {
                warn!(node_id = %self.id, error = %e, "failed to take snapshot");
                return;
            }
        };
        {
            let mut st = self.lock();
            let index = st.last_applied;
            let Some(term) = st.term_at(index) else {
                return;
            };
            if index <= st.snapshot_index {
                return;
            }
            let (configuration, _) = st.configuration_at(index);
            st.compact_to(index, term, configuration.clone());
            st.snapshot = Some(data.clone());
            st.unsaved.push(Unsaved::Snapshot {
                record: SnapshotRecord {
                    index,
                    term,
                    configuration,
                    data,
                },
                discard_log: false,
            });
            info!(node_id = %self.id, index, term, "log compacted into snapshot");
        }
        if let Err(e) = self.flush().await {
            warn!(node_id = %self.id, error = %e, "snapshot not persisted");
        }
    }

    /// Load durable state and bring the state machine up to the snapshot.
    async fn recover(&self) -> Result<()> {
        let recovered = self.log_store.load().await?;
        let mut applied = self.fsm.recover().await?;
        if let Some(snapshot) = &recovered.snapshot {
            if snapshot.index > applied {
                self.fsm.restore(&snapshot.data).await?;
                applied = snapshot.index;
            }
        }

        let mut st = self.lock();
        st.current_term = recovered.hard_state.current_term;
        st.voted_for = recovered.hard_state.voted_for;
        st.bootstrap_configuration = recovered.hard_state.bootstrap;
        if let Some(snapshot) = recovered.snapshot {
            st.snapshot_index = snapshot.index;
            st.snapshot_term = snapshot.term;
            st.snapshot_configuration = snapshot.configuration;
            st.snapshot = Some(snapshot.data);
        }
        st.log = recovered.entries;
        st.refresh_configuration();
        st.durable_index = st.last_index();
        st.last_applied = applied.min(st.last_index()).max(st.snapshot_index);
        st.commit_index = st.last_applied;
        if st.current_term > 0 || !st.log.is_empty() {
            info!(
                node_id = %self.id,
                term = st.current_term,
                last_index = st.last_index(),
                last_applied = st.last_applied,
                voters = st.configuration.members.len(),
                "replication state recovered"
            );
        }
        self.publish(&st);
        Ok(())
    }

    async fn submit(self: &Arc<Self>, payload: EntryPayload, timeout: Duration) -> Result<ApplyResponse> {
        let rx = {
            let mut st = self.lock();
            st.check_leader()?;
            let index = st.last_index() + 1;
            let term = st.current_term;
            st.append(LogEntry { index, term, payload });
            let (tx, rx) = oneshot::channel();
            st.pending.insert(index, Pending { term, tx });
            rx
        };
        self.replicate_all();
        if let Err(e) = self.flush().await {
            // peers may still commit the entry; the timers retry the write
            warn!(node_id = %self.id, error = %e, "submitted entry not yet durable");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(GatewayError::consensus("leadership lost before the operation committed")),
            Err(_) => Err(timed_out(timeout)),
        }
    }

    async fn change_membership(
        self: &Arc<Self>,
        change: MembershipChange,
        timeout: Duration,
    ) -> Result<Configuration> {
        let next = {
            let mut st = self.lock();
            st.check_leader()?;
            if st.configuration_index > st.commit_index {
                return Err(GatewayError::conflict(
                    "a membership change is already in progress",
                    "configuration",
                ));
            }
            let next = st.configuration.apply(&change)?;
            if next == st.configuration {
                return Ok(next);
            }
            let start = st.last_index() + 1;
            let added: Vec<NodeId> = next
                .peers(&self.id)
                .filter(|(id, _)| !st.next_index.contains_key(*id))
                .map(|(id, _)| id.clone())
                .collect();
            for id in added {
                st.next_index.insert(id.clone(), start);
                st.match_index.insert(id, 0);
            }
            next
        };
        info!(node_id = %self.id, change = %change, "changing membership");
        self.submit(EntryPayload::Configuration(next.clone()), timeout)
            .await?
            .into_result()?;
        Ok(next)
    }

    async fn transfer_leadership(self: &Arc<Self>, target: Option<NodeId>, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        let (target, address) = {
            let st = self.lock();
            st.check_leader()?;
            let target = match target {
                Some(id) if id == self.id => return Ok(id),
                Some(id) if st.configuration.contains(&id) => id,
                Some(id) => return Err(GatewayError::not_found("voter", id)),
                None => st
                    .configuration
                    .voters(&self.id)
                    .max_by_key(|(id, _)| st.match_index.get(*id).copied().unwrap_or(0))
                    .map(|(id, _)| id.clone())
                    .ok_or_else(|| GatewayError::consensus("no other voter to transfer leadership to"))?,
            };
            let address = st
                .configuration
                .address(&target)
                .cloned()
                .ok_or_else(|| GatewayError::not_found("voter", target.as_str()))?;
            (target, address)
        };

        loop {
            let caught_up = {
                let st = self.lock();
                st.check_leader()?;
                st.match_index.get(&target).copied().unwrap_or(0) >= st.last_index()
            };
            if caught_up {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(timed_out(timeout));
            }
            Arc::clone(self).replicate_to(target.clone(), address.clone()).await;
            tokio::time::sleep(self.options.heartbeat).await;
        }

        let mut rx = self.leader_tx.subscribe();
        let term = self.lock().current_term;
        info!(node_id = %self.id, target = %target, term, "transferring leadership");
        self.transport
            .send_timeout_now(
                &address,
                TimeoutNowRequest {
                    term,
                    leader_id: self.id.clone(),
                },
            )
            .await?;
        let handed_over = rx.wait_for(|state| state.role != Role::Leader && state.leader_id.as_deref() == Some(target.as_str()));
        let outcome = match tokio::time::timeout_at(deadline, handed_over).await {
            Ok(Ok(_)) => Ok(target),
            Ok(Err(_)) => Err(GatewayError::consensus("member shut down during leadership transfer")),
            Err(_) => Err(timed_out(timeout)),
        };
        outcome
    }

    fn stats(&self) -> RaftStats {
        let st = self.lock();
        RaftStats {
            id: self.id.clone(),
            role: st.role,
            term: st.current_term,
            leader_id: st.leader_id.clone(),
            last_log_index: st.last_index(),
            last_log_term: st.last_term(),
            commit_index: st.commit_index,
            last_applied: st.last_applied,
            snapshot_index: st.snapshot_index,
            configuration_index: st.configuration_index,
            configuration: st.configuration.clone(),
        }
    }
}

#[async_trait]
impl RpcHandler for Shared {
    async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let response = {
            let mut st = self.lock();
            if st.role == Role::Shutdown {
                return Err(GatewayError::consensus("member is shut down"));
            }
            let reject = |st: &RaftState| AppendEntriesResponse {
                term: st.current_term,
                success: false,
                last_index: st.last_index(),
            };
            if req.term < st.current_term {
                return Ok(reject(&*st));
            }
            self.observe_leader(&mut st, req.term, &req.leader_id);
            st.last_contact = Instant::now();

            if req.prev_log_index > st.last_index() {
                reject(&*st)
            } else if req.prev_log_index >= st.snapshot_index
                && st.term_at(req.prev_log_index) != Some(req.prev_log_term)
            {
                st.truncate_from(req.prev_log_index);
                reject(&*st)
            } else {
                let mut last_new = req.prev_log_index;
                for entry in req.entries {
                    last_new = entry.index;
                    if entry.index <= st.snapshot_index {
                        continue;
                    }
                    match st.term_at(entry.index) {
                        Some(term) if term == entry.term => continue,
                        Some(_) => st.truncate_from(entry.index),
                        None => {}
                    }
                    st.append(entry);
                }

                let new_commit = req.leader_commit.min(last_new);
                if new_commit > st.commit_index {
                    st.commit_index = new_commit;
                }
                AppendEntriesResponse {
                    term: st.current_term,
                    success: true,
                    last_index: st.last_index(),
                }
            }
        };
        // acknowledge only what is durable
        self.flush().await?;
        Ok(response)
    }

    async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let response = {
            let mut st = self.lock();
            if st.role == Role::Shutdown {
                return Err(GatewayError::consensus("member is shut down"));
            }
            if req.term < st.current_term || !st.configuration.contains(&req.candidate_id) {
                debug!(node_id = %self.id, candidate = %req.candidate_id, term = req.term, "vote refused");
                return Ok(RequestVoteResponse {
                    term: st.current_term,
                    vote_granted: false,
                });
            }
            self.observe_term(&mut st, req.term);

            let up_to_date = (req.last_log_term, req.last_log_index) >= (st.last_term(), st.last_index());
            let can_vote = st
                .voted_for
                .as_ref()
                .map_or(true, |candidate| candidate == &req.candidate_id);
            let vote_granted = up_to_date && can_vote;
            if vote_granted {
                if st.voted_for.is_none() {
                    st.voted_for = Some(req.candidate_id.clone());
                    st.unsaved.push(Unsaved::HardState);
                }
                st.last_contact = Instant::now();
                debug!(node_id = %self.id, candidate = %req.candidate_id, term = req.term, "vote granted");
            }
            RequestVoteResponse {
                term: st.current_term,
                vote_granted,
            }
        };
        self.flush().await?;
        Ok(response)
    }

    async fn install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let stale = {
            let mut st = self.lock();
            if st.role == Role::Shutdown {
                return Err(GatewayError::consensus("member is shut down"));
            }
            if req.term < st.current_term {
                return Ok(InstallSnapshotResponse {
                    term: st.current_term,
                });
            }
            self.observe_leader(&mut st, req.term, &req.leader_id);
            st.last_contact = Instant::now();
            req.last_included_index <= st.last_applied
        };
        if stale {
            self.flush().await?;
            return Ok(InstallSnapshotResponse {
                term: self.lock().current_term,
            });
        }

        let _guard = self.apply_lock.lock().await;
        self.fsm.restore(&req.data).await?;

        let term = {
            let mut st = self.lock();
            let index = req.last_included_index;
            let keep_suffix = st.term_at(index) == Some(req.last_included_term);
            if keep_suffix {
                st.compact_to(index, req.last_included_term, req.configuration.clone());
            } else {
                st.log.clear();
                st.compact_to(index, req.last_included_term, req.configuration.clone());
                st.truncations += 1;
                st.durable_index = st.durable_index.min(index);
            }
            st.snapshot = Some(req.data.clone());
            st.refresh_configuration();
            st.commit_index = st.commit_index.max(index);
            st.last_applied = st.last_applied.max(index);
            st.unsaved.push(Unsaved::Snapshot {
                record: SnapshotRecord {
                    index,
                    term: req.last_included_term,
                    configuration: req.configuration,
                    data: req.data,
                },
                discard_log: !keep_suffix,
            });
            info!(node_id = %self.id, index, "installed snapshot from leader");
            st.current_term
        };
        self.flush().await?;
        Ok(InstallSnapshotResponse { term })
    }

    async fn timeout_now(&self, req: TimeoutNowRequest) -> Result<TimeoutNowResponse> {
        let st = self.lock();
        if st.role == Role::Shutdown {
            return Err(GatewayError::consensus("member is shut down"));
        }
        if req.term >= st.current_term && st.configuration.contains(&self.id) {
            info!(node_id = %self.id, leader_id = %req.leader_id, "leadership handed over, campaigning");
            self.campaign_now.notify_one();
        }
        Ok(TimeoutNowResponse {
            term: st.current_term,
        })
    }
}

/// Administration surface registered with the transport.
struct Admin(Arc<Shared>);

#[async_trait]
impl ClusterAdmin for Admin {
    async fn change_membership(&self, change: MembershipChange, timeout: Duration) -> Result<Configuration> {
        self.0.change_membership(change, timeout).await
    }

    async fn transfer_leadership(&self, target: Option<NodeId>, timeout: Duration) -> Result<NodeId> {
        self.0.transfer_leadership(target, timeout).await
    }

    fn stats(&self) -> RaftStats {
        self.0.stats()
    }
}

/// Handle to a replicated-log member.
pub struct ReplicatedLog {
    shared: Arc<Shared>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicatedLog {
    pub fn new(
        id: impl Into<NodeId>,
        transport: Arc<dyn ConsensusTransport>,
        fsm: Arc<dyn StateMachine>,
        storage: Arc<dyn Storage>,
        options: RaftOptions,
    ) -> Self {
        let state = RaftState::new(options.election_timeout);
        let (leader_tx, _) = watch::channel(state.leader_state());
        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                options,
                transport,
                fsm,
                log_store: LogStore::new(storage),
                state: Mutex::new(state),
                leader_tx,
                apply_notify: Notify::new(),
                campaign_now: Notify::new(),
                apply_lock: tokio::sync::Mutex::new(()),
                io_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn commit_index(&self) -> u64 {
        self.shared.lock().commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.shared.lock().last_applied
    }

    /// Index of the last entry folded into a snapshot (0 when none).
    pub fn snapshot_index(&self) -> u64 {
        self.shared.lock().snapshot_index
    }

    pub fn current_term(&self) -> u64 {
        self.shared.lock().current_term
    }
}

#[async_trait]
impl Consensus for ReplicatedLog {
    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.recover().await?;

        let handler: Arc<dyn RpcHandler> = self.shared.clone();
        self.shared.transport.register_handler(handler);
        self.shared
            .transport
            .register_admin(Arc::new(Admin(Arc::clone(&self.shared))));
        self.shared.transport.run().await?;

        let timers = tokio::spawn(Arc::clone(&self.shared).run_timers());
        let applier = tokio::spawn(Arc::clone(&self.shared).run_applier());
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([timers, applier]);
        info!(
            node_id = %self.shared.id,
            address = %self.shared.transport.address(),
            "replicated log started"
        );
        Ok(())
    }

    async fn submit(&self, op: Operation, timeout: Duration) -> Result<ApplyResponse> {
        self.shared.submit(EntryPayload::Operation(op), timeout).await
    }

    fn id(&self) -> NodeId {
        self.shared.id.clone()
    }

    fn leader_id(&self) -> Option<NodeId> {
        self.shared.lock().leader_id.clone()
    }

    fn is_leader(&self) -> bool {
        self.shared.lock().role == Role::Leader
    }

    fn role(&self) -> Role {
        self.shared.lock().role
    }

    async fn bootstrap(&self, config: Configuration) -> Result<()> {
        {
            let mut st = self.shared.lock();
            if !st.configuration.is_empty() || st.last_index() > 0 {
                return Err(GatewayError::consensus("cluster is already bootstrapped"));
            }
            if config.members.is_empty() {
                return Err(GatewayError::validation("bootstrap configuration has no voters"));
            }
            info!(node_id = %self.shared.id, members = config.members.len(), "bootstrapping cluster");
            st.bootstrap_configuration = config.clone();
            st.configuration = config;
            st.configuration_index = 0;
            st.last_contact = Instant::now();
            st.unsaved.push(Unsaved::HardState);
        }
        self.shared.flush().await
    }

    fn configuration(&self) -> Configuration {
        self.shared.lock().configuration.clone()
    }

    async fn change_membership(&self, change: MembershipChange, timeout: Duration) -> Result<Configuration> {
        self.shared.change_membership(change, timeout).await
    }

    async fn transfer_leadership(&self, target: Option<NodeId>, timeout: Duration) -> Result<NodeId> {
        self.shared.transfer_leadership(target, timeout).await
    }

    fn stats(&self) -> RaftStats {
        self.shared.stats()
    }

    fn subscribe_leader(&self) -> watch::Receiver<LeaderState> {
        self.shared.leader_tx.subscribe()
    }

    async fn shutdown(&self) {
        {
            let mut st = self.shared.lock();
            if st.role == Role::Shutdown {
                return;
            }
            st.step_down();
            st.role = Role::Shutdown;
            st.leader_id = None;
            self.shared.publish(&st);
        }
        self.shared.shutdown.cancel();
        self.shared.transport.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.shared.flush().await {
            warn!(node_id = %self.shared.id, error = %e, "replication state not flushed on shutdown");
        }
        info!(node_id = %self.shared.id, "replicated log stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::MemoryNetwork;
    use crate::storage::MemoryStorage;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct RecordingMachine {
        applied: Mutex<Vec<Vec<u8>>>,
        last_index: Mutex<u64>,
        snapshot_every: u64,
    }

    impl RecordingMachine {
        fn applied(&self) -> Vec<Vec<u8>> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StateMachine for RecordingMachine {
        async fn apply(&self, index: u64, op: &Operation) -> ApplyResponse {
            *self.last_index.lock().unwrap() = index;
            if op.data == b"reject" {
                return ApplyResponse::failed("rejected");
            }
            self.applied.lock().unwrap().push(op.data.clone());
            ApplyResponse::ok()
        }

        async fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(serde_json::to_vec(&self.applied())?)
        }

        async fn restore(&self, data: &[u8]) -> Result<()> {
            *self.applied.lock().unwrap() = serde_json::from_slice(data)?;
            Ok(())
        }

        fn need_snapshot(&self, log_size: u64) -> bool {
            self.snapshot_every > 0 && log_size >= self.snapshot_every
        }

        async fn recover(&self) -> Result<u64> {
            Ok(*self.last_index.lock().unwrap())
        }
    }

    fn options() -> RaftOptions {
        RaftOptions {
            election_timeout: Duration::from_millis(60),
            heartbeat: Duration::from_millis(15),
        }
    }

    struct Member {
        log: ReplicatedLog,
        fsm: Arc<RecordingMachine>,
        storage: Arc<MemoryStorage>,
        id: String,
        address: String,
    }

    impl Member {
        fn new(network: &Arc<MemoryNetwork>, i: usize, snapshot_every: u64) -> Self {
            let id = format!("node-{}", i);
            let address = format!("10.0.0.{}:9090", i + 1);
            let fsm = Arc::new(RecordingMachine {
                snapshot_every,
                ..Default::default()
            });
            let storage = Arc::new(MemoryStorage::new());
            let log = ReplicatedLog::new(
                id.clone(),
                network.transport(address.clone()),
                fsm.clone(),
                storage.clone(),
                options(),
            );
            Member {
                log,
                fsm,
                storage,
                id,
                address,
            }
        }

        /// Same identity, storage and state machine; fresh in-memory replication state.
        fn restarted(&self, network: &Arc<MemoryNetwork>) -> Self {
            let log = ReplicatedLog::new(
                self.id.clone(),
                network.transport(self.address.clone()),
                self.fsm.clone(),
                self.storage.clone(),
                options(),
            );
            Member {
                log,
                fsm: self.fsm.clone(),
                storage: self.storage.clone(),
                id: self.id.clone(),
                address: self.address.clone(),
            }
        }
    }

    fn cluster(network: &Arc<MemoryNetwork>, size: usize, snapshot_every: u64) -> (Vec<Member>, Configuration) {
        let nodes: Vec<Member> = (0..size).map(|i| Member::new(network, i, snapshot_every)).collect();
        let members: BTreeMap<NodeId, String> = nodes
            .iter()
            .map(|m| (m.id.clone(), m.address.clone()))
            .collect();
        (nodes, Configuration::new(members))
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn leader_of(members: &[Member]) -> usize {
        for _ in 0..400 {
            if let Some(i) = members.iter().position(|m| m.log.is_leader()) {
                return i;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }

    async fn submit(member: &Member, payload: &[u8]) -> ApplyResponse {
        member
            .log
            .submit(Operation::replicated(payload.to_vec()), Duration::from_secs(2))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_member_elects_itself_and_applies() {
        let network = MemoryNetwork::new();
        let (members, config) = cluster(&network, 1, 0);
        let member = &members[0];
        member.log.start().await.unwrap();
        member.log.bootstrap(config.clone()).await.unwrap();
        assert!(member.log.bootstrap(config).await.is_err());

        leader_of(&members).await;
        assert!(submit(member, b"one").await.success);
        assert_eq!(member.fsm.applied(), vec![b"one".to_vec()]);

        let resp = submit(member, b"reject").await;
        assert_eq!(resp.error.as_deref(), Some("rejected"));
        member.log.shutdown().await;
        assert_eq!(member.log.role(), Role::Shutdown);
    }

    #[tokio::test]
    async fn test_three_members_replicate_in_order() {
        let network = MemoryNetwork::new();
        let (members, config) = cluster(&network, 3, 0);
        for member in &members {
            member.log.start().await.unwrap();
            member.log.bootstrap(config.clone()).await.unwrap();
        }
        let leader = leader_of(&members).await;
        let follower = (leader + 1) % members.len();

        let err = members[follower]
            .log
            .submit(Operation::replicated(b"x".to_vec()), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotLeader));

        for payload in ["a", "b", "c"] {
            submit(&members[leader], payload.as_bytes()).await;
        }
        let expected: Vec<Vec<u8>> = ["a", "b", "c"].iter().map(|s| s.as_bytes().to_vec()).collect();
        for member in &members {
            wait_for(|| member.fsm.applied() == expected).await;
            assert_eq!(
                member.log.leader_id().as_deref(),
                Some(format!("node-{}", leader).as_str())
            );
        }
        for member in &members {
            member.log.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_failover_after_leader_partition() {
        let network = MemoryNetwork::new();
        let (members, config) = cluster(&network, 3, 0);
        for member in &members {
            member.log.start().await.unwrap();
            member.log.bootstrap(config.clone()).await.unwrap();
        }
        let old_leader = leader_of(&members).await;
        submit(&members[old_leader], b"before").await;

        network.disconnect(&members[old_leader].address);
        let survivors: Vec<usize> = (0..3).filter(|i| *i != old_leader).collect();
        wait_for(|| survivors.iter().any(|i| members[*i].log.is_leader())).await;
        let new_leader = survivors
            .iter()
            .copied()
            .find(|i| members[*i].log.is_leader())
            .unwrap();

        submit(&members[new_leader], b"after").await;

        network.reconnect(&members[old_leader].address);
        let expected = vec![b"before".to_vec(), b"after".to_vec()];
        wait_for(|| members[old_leader].fsm.applied() == expected).await;
        assert!(!members[old_leader].log.is_leader());
        for member in &members {
            member.log.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_lagging_member_catches_up_from_snapshot() {
        let network = MemoryNetwork::new();
        let (members, config) = cluster(&network, 3, 2);
        // the third member stays offline while the log is compacted
        for member in &members[..2] {
            member.log.start().await.unwrap();
            member.log.bootstrap(config.clone()).await.unwrap();
        }
        let leader = leader_of(&members[..2]).await;
        for i in 0..6u8 {
            submit(&members[leader], &[i]).await;
        }
        wait_for(|| members[leader].log.snapshot_index() > 0).await;

        let late = &members[2];
        late.log.start().await.unwrap();
        let expected: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i]).collect();
        wait_for(|| late.fsm.applied() == expected).await;
        assert!(late.log.snapshot_index() > 0);
        assert_eq!(late.log.configuration(), config);
        for member in &members {
            member.log.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_leader_changes_are_published() {
        let network = MemoryNetwork::new();
        let (members, config) = cluster(&network, 1, 0);
        let mut rx = members[0].log.subscribe_leader();
        members[0].log.start().await.unwrap();
        members[0].log.bootstrap(config).await.unwrap();
        let state = tokio::time::timeout(
            Duration::from_secs(3),
            rx.wait_for(|s| s.role == Role::Leader),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(state.leader_id.as_deref(), Some("node-0"));
        assert!(state.term >= 1);
        members[0].log.shutdown().await;
    }

    #[tokio::test]
    async fn test_restarted_member_keeps_term_vote_and_log() {
        let network = MemoryNetwork::new();
        let (members, config) = cluster(&network, 1, 0);
        let member = &members[0];
        member.log.start().await.unwrap();
        member.log.bootstrap(config.clone()).await.unwrap();
        leader_of(&members).await;
        submit(member, b"one").await;
        let term = member.log.current_term();
        let last_applied = member.log.last_applied();
        member.log.shutdown().await;

        let restarted = member.restarted(&network);
        restarted.log.start().await.unwrap();
        assert_eq!(restarted.log.configuration(), config);
        assert!(restarted.log.current_term() >= term);
        assert_eq!(restarted.log.last_applied(), last_applied);
        // the recovered membership means bootstrap is refused
        assert!(restarted.log.bootstrap(config).await.is_err());

        let members = vec![restarted];
        leader_of(&members).await;
        assert!(members[0].log.current_term() > term);
        submit(&members[0], b"two").await;
        // nothing applied before the restart is applied again
        assert_eq!(members[0].fsm.applied(), vec![b"one".to_vec(), b"two".to_vec()]);
        members[0].log.shutdown().await;
    }

    #[tokio::test]
    async fn test_follower_that_missed_a_commit_catches_up_after_full_restart() {
        let network = MemoryNetwork::new();
        let (members, config) = cluster(&network, 3, 0);
        for member in &members {
            member.log.start().await.unwrap();
            member.log.bootstrap(config.clone()).await.unwrap();
        }
        let leader = leader_of(&members).await;
        let lagging = (leader + 1) % 3;
        network.disconnect(&members[lagging].address);
        assert!(submit(&members[leader], b"team").await.success);
        for member in &members {
            member.log.shutdown().await;
        }
        network.reconnect(&members[lagging].address);

        let restarted: Vec<Member> = members.iter().map(|m| m.restarted(&network)).collect();
        for member in &restarted {
            member.log.start().await.unwrap();
        }
        leader_of(&restarted).await;
        for member in &restarted {
            wait_for(|| member.fsm.applied() == vec![b"team".to_vec()]).await;
        }
        for member in &restarted {
            member.log.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_vote_survives_restart() {
        let network = MemoryNetwork::new();
        let (members, config) = cluster(&network, 3, 0);
        // driven through the rpc handler directly so no timer can start an election
        let voter = &members[0];
        voter.log.bootstrap(config).await.unwrap();

        let ballot = |candidate: &str| RequestVoteRequest {
            term: 5,
            candidate_id: candidate.to_string(),
            last_log_index: 10,
            last_log_term: 4,
        };
        assert!(voter.log.shared.request_vote(ballot("node-1")).await.unwrap().vote_granted);

        let restarted = voter.restarted(&network);
        restarted.log.shared.recover().await.unwrap();
        assert_eq!(restarted.log.current_term(), 5);
        let resp = restarted.log.shared.request_vote(ballot("node-2")).await.unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);
        assert!(restarted.log.shared.request_vote(ballot("node-1")).await.unwrap().vote_granted);
        // members outside the configuration never get a vote
        assert!(!restarted.log.shared.request_vote(ballot("stranger")).await.unwrap().vote_granted);
    }

    #[tokio::test]
    async fn test_membership_changes_commit_through_the_log() {
        let network = MemoryNetwork::new();
        let (mut members, config) = cluster(&network, 1, 0);
        members[0].log.start().await.unwrap();
        members[0].log.bootstrap(config).await.unwrap();
        leader_of(&members).await;
        submit(&members[0], b"before-join").await;

        let joiner = Member::new(&network, 1, 0);
        joiner.log.start().await.unwrap();
        let timeout = Duration::from_secs(2);
        let added = members[0]
            .log
            .change_membership(
                MembershipChange::AddNonvoter {
                    id: joiner.id.clone(),
                    address: joiner.address.clone(),
                },
                timeout,
            )
            .await
            .unwrap();
        assert!(added.learners.contains_key(&joiner.id));
        wait_for(|| joiner.fsm.applied() == vec![b"before-join".to_vec()]).await;

        let promoted = members[0]
            .log
            .change_membership(
                MembershipChange::AddVoter {
                    id: joiner.id.clone(),
                    address: joiner.address.clone(),
                },
                timeout,
            )
            .await
            .unwrap();
        assert_eq!(promoted.quorum(), 2);
        wait_for(|| joiner.log.configuration() == promoted).await;

        let stats = members[0].log.stats();
        assert_eq!(stats.role, Role::Leader);
        assert_eq!(stats.configuration, promoted);
        assert!(stats.configuration_index > 0);
        members.push(joiner);

        let new_leader = members[0]
            .log
            .transfer_leadership(None, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(new_leader, "node-1");
        wait_for(|| {
            let stats = members[1].log.stats();
            stats.role == Role::Leader && stats.commit_index >= stats.configuration_index
        })
        .await;

        let after = members[1]
            .log
            .change_membership(MembershipChange::RemoveServer { id: "node-0".to_string() }, timeout)
            .await
            .unwrap();
        assert!(!after.is_member("node-0"));
        assert!(matches!(
            members[0]
                .log
                .change_membership(MembershipChange::RemoveServer { id: "node-1".to_string() }, timeout)
                .await,
            Err(GatewayError::NotLeader)
        ));
        for member in &members {
            member.log.shutdown().await;
        }
    }
}
