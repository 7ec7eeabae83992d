//! # Gateway State
//!
//! [`GatewayState`] owns the live resource graph and is the single place change logs are
//! applied. Add commands are upserts and delete commands tolerate missing targets, so a
//! change log can be applied more than once with the same result.
//!
//! Every successful change that can affect routing bumps a revision published on a
//! `watch` channel; the data plane rebuilds its routing table when it changes.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::changelog::{compact, Action, ChangeLog, Command, Resource};
use crate::config::{InitResources, NodeConfig};
use crate::errors::Result;
use crate::resources::{
    Collection, Document, Domain, Module, Named, Namespace, ResourceManager, ResourceSnapshot,
    Route, Secret, Service, DEFAULT_NAMESPACE,
};
use crate::store::Store;

/// Applies change logs to node state. Called by the replicated state machine for every
/// committed change log, and directly when replication is disabled.
#[async_trait]
pub trait StateManager: Send + Sync {
    async fn process_change_log(&self, cl: ChangeLog, reload: bool) -> Result<()>;

    async fn snapshot(&self) -> Result<ResourceSnapshot>;

    async fn restore(&self, snapshot: &ResourceSnapshot) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct StateOptions {
    /// Keep restoring past change logs that fail to apply
    pub debug: bool,
    pub disable_default_namespace: bool,
}

impl From<&NodeConfig> for StateOptions {
    fn from(node: &NodeConfig) -> Self {
        Self {
            debug: node.debug,
            disable_default_namespace: node.disable_default_namespace,
        }
    }
}

pub struct GatewayState {
    resources: RwLock<ResourceManager>,
    store: Arc<Store>,
    options: StateOptions,
    apply_lock: Mutex<()>,
    revision: watch::Sender<u64>,
    lifecycle: watch::Sender<Option<Command>>,
}

impl GatewayState {
    pub fn new(store: Arc<Store>, options: StateOptions) -> Arc<Self> {
        let mut resources = ResourceManager::new();
        if options.disable_default_namespace {
            // nothing references the namespace yet, so removal cannot fail
            let _ = resources.remove_namespace(DEFAULT_NAMESPACE);
        }
        let (revision, _) = watch::channel(0);
        let (lifecycle, _) = watch::channel(None);
        Arc::new(Self {
            resources: RwLock::new(resources),
            store,
            options,
            apply_lock: Mutex::new(()),
            revision,
            lifecycle,
        })
    }

    /// Connect storage, replay stored change logs, then join replication.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.store.connect().await?;
        self.restore_from_change_logs().await?;
        let manager: Arc<dyn StateManager> = self.clone();
        let weak: Weak<dyn StateManager> = Arc::downgrade(&manager);
        self.store.start_replication(weak).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.store.shutdown().await
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Read access to the resource graph.
    pub async fn resources(&self) -> RwLockReadGuard<'_, ResourceManager> {
        self.resources.read().await
    }

    /// Revision counter bumped whenever routing-relevant state changes.
    pub fn subscribe_revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Last lifecycle command (`shutdown`/`restart`) received.
    pub fn subscribe_lifecycle(&self) -> watch::Receiver<Option<Command>> {
        self.lifecycle.subscribe()
    }

    /// Admin entry point for a new change log.
    ///
    /// With replication the change log goes through the replicated log and is applied on
    /// every member; otherwise it is applied and persisted locally. The outcome is also
    /// delivered on the change log's error channel.
    pub async fn apply_change_log(&self, mut cl: ChangeLog) -> Result<()> {
        if self.store.replication_enabled() {
            let result = self.store.store_change_log(&cl).await;
            cl.push_error(result.as_ref().map(|_| ()));
            result
        } else {
            self.apply(cl, true, true).await
        }
    }

    /// Replay stored change logs in id order, then compact them. Returns how many were
    /// replayed.
    pub async fn restore_from_change_logs(&self) -> Result<usize> {
        let logs = self.store.fetch_change_logs().await?;
        if logs.is_empty() {
            debug!("no change logs found in storage");
            return Ok(0);
        }
        info!(count = logs.len(), "restoring change logs from storage");

        for cl in &logs {
            if let Err(e) = self.apply(cl.clone(), false, false).await {
                if self.options.debug {
                    warn!(change_log_id = %cl.id, cmd = %cl.cmd, error = %e, "ignoring failed change log in debug mode");
                } else {
                    return Err(e);
                }
            }
        }
        self.bump_revision();

        if logs.len() > 1 {
            let remove = compact(&logs);
            let removed = self.store.delete_change_logs(&remove).await?;
            if removed > 0 {
                info!(removed, total = logs.len(), "compacted change logs");
            }
        }
        Ok(logs.len())
    }

    /// Apply resources declared in configuration, in dependency order. On a replicated
    /// follower this is skipped; the leader's copy replicates to it.
    pub async fn apply_init_resources(&self, init: &InitResources) -> Result<usize> {
        if init.is_empty() {
            return Ok(0);
        }
        if self.store.replication_enabled() && !self.store.is_leader() {
            info!("skipping configured resources on follower");
            return Ok(0);
        }

        let mut logs = Vec::new();
        for ns in &init.namespaces {
            logs.push(add_log(Resource::Namespace, "", ns)?);
        }
        for module in &init.modules {
            logs.push(add_log(Resource::Module, &module.namespace, module)?);
        }
        for svc in &init.services {
            logs.push(add_log(Resource::Service, &svc.namespace, svc)?);
        }
        for route in &init.routes {
            logs.push(add_log(Resource::Route, &route.namespace, route)?);
        }
        for domain in &init.domains {
            logs.push(add_log(Resource::Domain, &domain.namespace, domain)?);
        }
        for collection in &init.collections {
            logs.push(add_log(Resource::Collection, &collection.namespace, collection)?);
        }
        for doc in &init.documents {
            logs.push(ChangeLog::new(Command::add(Resource::Document), &doc.namespace, &doc.id, doc)?);
        }
        for secret in &init.secrets {
            logs.push(add_log(Resource::Secret, &secret.namespace, secret)?);
        }

        let count = logs.len();
        for cl in logs {
            self.apply_change_log(cl).await?;
        }
        info!(count, "applied configured resources");
        Ok(count)
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    async fn apply(&self, mut cl: ChangeLog, reload: bool, persist: bool) -> Result<()> {
        let _guard = self.apply_lock.lock().await;
        let mut result = self.dispatch(&cl).await;
        let lifecycle = matches!(cl.cmd, Command::Shutdown | Command::Restart);
        if result.is_ok() && persist && !lifecycle {
            result = self.store.persist_change_log(&cl).await;
        }
        if result.is_ok() && reload && affects_routing(cl.cmd) {
            self.bump_revision();
        }
        if let Err(e) = &result {
            debug!(change_log_id = %cl.id, cmd = %cl.cmd, error = %e, "change log not applied");
        }
        cl.push_error(result.as_ref().map(|_| ()));
        result
    }

    async fn dispatch(&self, cl: &ChangeLog) -> Result<()> {
        let (action, resource) = match cl.cmd {
            Command::Noop => return Ok(()),
            Command::Shutdown | Command::Restart => {
                info!(cmd = %cl.cmd, "lifecycle command received");
                self.lifecycle.send_replace(Some(cl.cmd));
                return Ok(());
            }
            Command::Apply { action, resource } => (action, resource),
        };
        debug!(cmd = %cl.cmd, namespace = %cl.namespace, name = %cl.name, "processing change log");

        match (action, resource) {
            (Action::Add, Resource::Namespace) => {
                let ns: Namespace = cl.decode_item()?;
                self.resources.write().await.add_namespace(&ns).map(drop)
            }
            (Action::Delete, Resource::Namespace) => {
                self.resources.write().await.remove_namespace(&cl.name)
            }
            (Action::Add, Resource::Service) => {
                let svc: Service = cl.decode_item()?;
                self.resources.write().await.add_service(&svc).map(drop)
            }
            (Action::Delete, Resource::Service) => {
                self.resources.write().await.remove_service(&cl.namespace, &cl.name)
            }
            (Action::Add, Resource::Route) => {
                let route: Route = cl.decode_item()?;
                self.resources.write().await.add_route(&route).map(drop)
            }
            (Action::Delete, Resource::Route) => {
                self.resources.write().await.remove_route(&cl.namespace, &cl.name)
            }
            (Action::Add, Resource::Module) => {
                let module: Module = cl.decode_item()?;
                self.resources.write().await.add_module(&module).map(drop)
            }
            (Action::Delete, Resource::Module) => {
                self.resources.write().await.remove_module(&cl.namespace, &cl.name)
            }
            (Action::Add, Resource::Domain) => {
                let domain: Domain = cl.decode_item()?;
                self.resources.write().await.add_domain(&domain).map(drop)
            }
            (Action::Delete, Resource::Domain) => {
                self.resources.write().await.remove_domain(&cl.namespace, &cl.name)
            }
            (Action::Add, Resource::Secret) => {
                let secret: Secret = cl.decode_item()?;
                self.resources.write().await.add_secret(&secret).map(drop)
            }
            (Action::Delete, Resource::Secret) => {
                self.resources.write().await.remove_secret(&cl.namespace, &cl.name)
            }
            (Action::Add, Resource::Collection) => {
                let collection: Collection = cl.decode_item()?;
                self.resources.write().await.add_collection(&collection).map(drop)
            }
            (Action::Delete, Resource::Collection) => {
                self.resources.write().await.remove_collection(&cl.namespace, &cl.name)
            }
            (Action::Add, Resource::Document) => {
                let doc: Document = cl.decode_item()?;
                self.resources.read().await.resolve_document(&doc)?;
                self.store.store_document(&doc).await
            }
            (Action::Delete, Resource::Document) => {
                let doc: Document = cl.decode_item()?;
                self.store
                    .delete_document(&doc.namespace, &doc.collection, &doc.id)
                    .await
            }
        }
    }
}

fn add_log<T: Serialize + Named>(resource: Resource, namespace: &str, item: &T) -> Result<ChangeLog> {
    ChangeLog::new(Command::add(resource), namespace, item.name(), item)
}

fn affects_routing(cmd: Command) -> bool {
    match cmd {
        Command::Noop => true,
        Command::Apply { resource, .. } => resource.is_related_to(Resource::Route),
        Command::Shutdown | Command::Restart => false,
    }
}

#[async_trait]
impl StateManager for GatewayState {
    async fn process_change_log(&self, cl: ChangeLog, reload: bool) -> Result<()> {
        self.apply(cl, reload, true).await
    }

    async fn snapshot(&self) -> Result<ResourceSnapshot> {
        let _guard = self.apply_lock.lock().await;
        let mut snapshot = self.resources.read().await.snapshot();
        snapshot.documents = self.store.fetch_all_documents().await?;
        Ok(snapshot)
    }

    /// Replace the graph and documents, then rewrite the local change logs so a restart
    /// replays the restored state rather than the history it replaced.
    async fn restore(&self, snapshot: &ResourceSnapshot) -> Result<()> {
        let _guard = self.apply_lock.lock().await;
        let restored = ResourceManager::from_snapshot(snapshot)?;
        let rebuilt = snapshot.to_change_logs()?;

        let stale = self.store.fetch_change_logs().await?;
        self.store.delete_change_logs(&stale).await?;
        for cl in &rebuilt {
            self.store.persist_change_log(cl).await?;
        }
        self.store.replace_documents(&snapshot.documents).await?;

        *self.resources.write().await = restored;
        self.bump_revision();
        info!(
            change_logs = rebuilt.len(),
            replaced = stale.len(),
            documents = snapshot.documents.len(),
            "state restored from snapshot"
        );
        Ok(())
    }
}
