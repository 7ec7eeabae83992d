//! # Resource Manager
//!
//! In-memory resource graph. Every kind lives in its own map keyed by
//! `(namespace, name)`; routes reference services and modules by key, and documents
//! reference collections by key. References are checked on insert and resolved on read.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::external::{
    Collection, Document, Domain, Module, Named, Namespace, Route, Secret, Service,
    DEFAULT_NAMESPACE,
};
use super::internal::{
    GatewayCollection, GatewayDocument, GatewayDomain, GatewayModule, GatewayNamespace,
    GatewayRoute, GatewaySecret, GatewayService, ResourceKey,
};
use super::transform::{self, Resolver};
use crate::changelog::{ChangeLog, Command, Resource};
use crate::errors::{GatewayError, Result};

/// Full graph in external form, secret material included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub namespaces: Vec<Namespace>,
    pub services: Vec<Service>,
    pub modules: Vec<Module>,
    pub routes: Vec<Route>,
    pub domains: Vec<Domain>,
    pub secrets: Vec<Secret>,
    pub collections: Vec<Collection>,
    /// Collection contents. The graph does not hold documents; the state layer fills
    /// this from storage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<Document>,
}

impl ResourceSnapshot {
    /// Add change logs that rebuild this graph, in dependency order. Documents are
    /// excluded; they live in storage on their own.
    pub fn to_change_logs(&self) -> Result<Vec<ChangeLog>> {
        fn add<T: Serialize + Named>(resource: Resource, namespace: &str, item: &T) -> Result<ChangeLog> {
            ChangeLog::new(Command::add(resource), namespace, item.name(), item)
        }

        let mut logs = Vec::new();
        for ns in &self.namespaces {
            logs.push(add(Resource::Namespace, "", ns)?);
        }
        for svc in &self.services {
            logs.push(add(Resource::Service, &svc.namespace, svc)?);
        }
        for module in &self.modules {
            logs.push(add(Resource::Module, &module.namespace, module)?);
        }
        for route in &self.routes {
            logs.push(add(Resource::Route, &route.namespace, route)?);
        }
        for domain in &self.domains {
            logs.push(add(Resource::Domain, &domain.namespace, domain)?);
        }
        for secret in &self.secrets {
            logs.push(add(Resource::Secret, &secret.namespace, secret)?);
        }
        for collection in &self.collections {
            logs.push(add(Resource::Collection, &collection.namespace, collection)?);
        }
        Ok(logs)
    }
}

#[derive(Debug, Clone)]
pub struct ResourceManager {
    namespaces: BTreeMap<String, GatewayNamespace>,
    services: BTreeMap<ResourceKey, GatewayService>,
    routes: BTreeMap<ResourceKey, GatewayRoute>,
    modules: BTreeMap<ResourceKey, GatewayModule>,
    domains: BTreeMap<ResourceKey, GatewayDomain>,
    secrets: BTreeMap<ResourceKey, GatewaySecret>,
    collections: BTreeMap<ResourceKey, GatewayCollection>,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for ResourceManager {
    fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    fn has_service(&self, key: &ResourceKey) -> bool {
        self.services.contains_key(key)
    }

    fn has_module(&self, key: &ResourceKey) -> bool {
        self.modules.contains_key(key)
    }

    fn collection(&self, key: &ResourceKey) -> Option<&GatewayCollection> {
        self.collections.get(key)
    }
}

fn in_namespace<'a, T>(map: &'a BTreeMap<ResourceKey, T>, namespace: &str) -> Vec<&'a T> {
    map.iter()
        .filter(|(k, _)| k.namespace == namespace)
        .map(|(_, v)| v)
        .collect()
}

impl ResourceManager {
    /// A graph holding only the implicit default namespace.
    pub fn new() -> Self {
        let mut namespaces = BTreeMap::new();
        let default = Namespace::default_namespace();
        namespaces.insert(
            default.name.clone(),
            GatewayNamespace {
                name: default.name,
                tags: default.tags,
            },
        );
        Self {
            namespaces,
            services: BTreeMap::new(),
            routes: BTreeMap::new(),
            modules: BTreeMap::new(),
            domains: BTreeMap::new(),
            secrets: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    // Namespaces

    pub fn add_namespace(&mut self, ns: &Namespace) -> Result<GatewayNamespace> {
        let internal = transform::namespace_to_internal(ns)?;
        self.namespaces.insert(internal.name.clone(), internal.clone());
        Ok(internal)
    }

    /// Fails while anything still lives in the namespace; missing namespaces are ignored.
    pub fn remove_namespace(&mut self, name: &str) -> Result<()> {
        if !self.namespaces.contains_key(name) {
            debug!(namespace = %name, "namespace already removed");
            return Ok(());
        }
        let in_use = [
            (Resource::Route, in_namespace(&self.routes, name).len()),
            (Resource::Service, in_namespace(&self.services, name).len()),
            (Resource::Module, in_namespace(&self.modules, name).len()),
            (Resource::Domain, in_namespace(&self.domains, name).len()),
            (Resource::Secret, in_namespace(&self.secrets, name).len()),
            (Resource::Collection, in_namespace(&self.collections, name).len()),
        ];
        if let Some((kind, count)) = in_use.iter().find(|(_, count)| *count > 0) {
            return Err(GatewayError::conflict(
                format!("cannot delete namespace {}: {} {}(s) still linked", name, count, kind),
                Resource::Namespace,
            ));
        }
        self.namespaces.remove(name);
        Ok(())
    }

    pub fn get_namespace(&self, name: &str) -> Option<&GatewayNamespace> {
        self.namespaces.get(name)
    }

    pub fn list_namespaces(&self) -> Vec<&GatewayNamespace> {
        self.namespaces.values().collect()
    }

    // Services

    pub fn add_service(&mut self, svc: &Service) -> Result<GatewayService> {
        let internal = transform::service_to_internal(svc, self)?;
        self.services.insert(internal.key(), internal.clone());
        Ok(internal)
    }

    pub fn remove_service(&mut self, namespace: &str, name: &str) -> Result<()> {
        let key = ResourceKey::new(namespace, name);
        if let Some(route) = self.routes.values().find(|r| r.service.as_ref() == Some(&key)) {
            return Err(GatewayError::conflict(
                format!("cannot delete service {}: route {} still linked", name, route.name),
                Resource::Service,
            ));
        }
        self.services.remove(&key);
        Ok(())
    }

    pub fn get_service(&self, namespace: &str, name: &str) -> Option<&GatewayService> {
        self.services.get(&ResourceKey::new(namespace, name))
    }

    pub fn list_services(&self, namespace: Option<&str>) -> Vec<&GatewayService> {
        match namespace {
            Some(ns) => in_namespace(&self.services, ns),
            None => self.services.values().collect(),
        }
    }

    // Routes

    pub fn add_route(&mut self, route: &Route) -> Result<GatewayRoute> {
        let internal = transform::route_to_internal(route, self)?;
        self.routes.insert(internal.key(), internal.clone());
        Ok(internal)
    }

    pub fn remove_route(&mut self, namespace: &str, name: &str) -> Result<()> {
        self.routes.remove(&ResourceKey::new(namespace, name));
        Ok(())
    }

    pub fn get_route(&self, namespace: &str, name: &str) -> Option<&GatewayRoute> {
        self.routes.get(&ResourceKey::new(namespace, name))
    }

    pub fn list_routes(&self, namespace: Option<&str>) -> Vec<&GatewayRoute> {
        match namespace {
            Some(ns) => in_namespace(&self.routes, ns),
            None => self.routes.values().collect(),
        }
    }

    /// Routes grouped by namespace name.
    pub fn namespace_routes_map(&self) -> BTreeMap<String, Vec<&GatewayRoute>> {
        let mut map: BTreeMap<String, Vec<&GatewayRoute>> = BTreeMap::new();
        for route in self.routes.values() {
            map.entry(route.namespace.clone()).or_default().push(route);
        }
        map
    }

    pub fn route_service(&self, route: &GatewayRoute) -> Option<&GatewayService> {
        route.service.as_ref().and_then(|k| self.services.get(k))
    }

    pub fn route_modules(&self, route: &GatewayRoute) -> Vec<&GatewayModule> {
        route
            .modules
            .iter()
            .filter_map(|k| self.modules.get(k))
            .collect()
    }

    // Modules

    pub fn add_module(&mut self, module: &Module) -> Result<GatewayModule> {
        let internal = transform::module_to_internal(module, self)?;
        self.modules.insert(
            ResourceKey::new(&internal.namespace, &internal.name),
            internal.clone(),
        );
        Ok(internal)
    }

    pub fn remove_module(&mut self, namespace: &str, name: &str) -> Result<()> {
        let key = ResourceKey::new(namespace, name);
        if let Some(route) = self.routes.values().find(|r| r.modules.contains(&key)) {
            return Err(GatewayError::conflict(
                format!("cannot delete module {}: route {} still linked", name, route.name),
                Resource::Module,
            ));
        }
        self.modules.remove(&key);
        Ok(())
    }

    pub fn get_module(&self, namespace: &str, name: &str) -> Option<&GatewayModule> {
        self.modules.get(&ResourceKey::new(namespace, name))
    }

    pub fn list_modules(&self, namespace: Option<&str>) -> Vec<&GatewayModule> {
        match namespace {
            Some(ns) => in_namespace(&self.modules, ns),
            None => self.modules.values().collect(),
        }
    }

    // Domains

    pub fn add_domain(&mut self, domain: &Domain) -> Result<GatewayDomain> {
        let internal = transform::domain_to_internal(domain, self)?;
        self.domains.insert(
            ResourceKey::new(&internal.namespace, &internal.name),
            internal.clone(),
        );
        Ok(internal)
    }

    pub fn remove_domain(&mut self, namespace: &str, name: &str) -> Result<()> {
        self.domains.remove(&ResourceKey::new(namespace, name));
        Ok(())
    }

    pub fn get_domain(&self, namespace: &str, name: &str) -> Option<&GatewayDomain> {
        self.domains.get(&ResourceKey::new(namespace, name))
    }

    pub fn list_domains(&self, namespace: Option<&str>) -> Vec<&GatewayDomain> {
        match namespace {
            Some(ns) => in_namespace(&self.domains, ns),
            None => self.domains.values().collect(),
        }
    }

    /// Domains ordered by descending priority, then by key for determinism.
    pub fn domains_by_priority(&self) -> Vec<&GatewayDomain> {
        let mut domains: Vec<&GatewayDomain> = self.domains.values().collect();
        domains.sort_by(|a, b| b.priority.cmp(&a.priority));
        domains
    }

    // Secrets

    pub fn add_secret(&mut self, secret: &Secret) -> Result<GatewaySecret> {
        let internal = transform::secret_to_internal(secret, self)?;
        self.secrets.insert(
            ResourceKey::new(&internal.namespace, &internal.name),
            internal.clone(),
        );
        Ok(internal)
    }

    pub fn remove_secret(&mut self, namespace: &str, name: &str) -> Result<()> {
        self.secrets.remove(&ResourceKey::new(namespace, name));
        Ok(())
    }

    pub fn get_secret(&self, namespace: &str, name: &str) -> Option<&GatewaySecret> {
        self.secrets.get(&ResourceKey::new(namespace, name))
    }

    pub fn list_secrets(&self, namespace: Option<&str>) -> Vec<&GatewaySecret> {
        match namespace {
            Some(ns) => in_namespace(&self.secrets, ns),
            None => self.secrets.values().collect(),
        }
    }

    // Collections

    pub fn add_collection(&mut self, collection: &Collection) -> Result<GatewayCollection> {
        let internal = transform::collection_to_internal(collection, self)?;
        self.collections.insert(
            ResourceKey::new(&internal.namespace, &internal.name),
            internal.clone(),
        );
        Ok(internal)
    }

    pub fn remove_collection(&mut self, namespace: &str, name: &str) -> Result<()> {
        self.collections.remove(&ResourceKey::new(namespace, name));
        Ok(())
    }

    pub fn get_collection(&self, namespace: &str, name: &str) -> Option<&GatewayCollection> {
        self.collections.get(&ResourceKey::new(namespace, name))
    }

    pub fn list_collections(&self, namespace: Option<&str>) -> Vec<&GatewayCollection> {
        match namespace {
            Some(ns) => in_namespace(&self.collections, ns),
            None => self.collections.values().collect(),
        }
    }

    // Documents

    /// Resolve and validate a document against its collection.
    pub fn resolve_document(&self, doc: &super::external::Document) -> Result<GatewayDocument> {
        transform::document_to_internal(doc, self)
    }

    // Snapshots

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            namespaces: self.namespaces.values().map(Namespace::from).collect(),
            services: self.services.values().map(Service::from).collect(),
            modules: self.modules.values().map(Module::from).collect(),
            routes: self.routes.values().map(Route::from).collect(),
            domains: self.domains.values().map(transform::domain_to_snapshot).collect(),
            secrets: self.secrets.values().map(transform::secret_to_snapshot).collect(),
            collections: self.collections.values().map(Collection::from).collect(),
            documents: Vec::new(),
        }
    }

    /// Rebuild a graph from a snapshot, inserting kinds in dependency order.
    pub fn from_snapshot(snapshot: &ResourceSnapshot) -> Result<Self> {
        let mut rm = Self::new();
        if !snapshot.namespaces.iter().any(|n| n.name == DEFAULT_NAMESPACE) {
            rm.namespaces.clear();
        }
        for ns in &snapshot.namespaces {
            rm.add_namespace(ns)?;
        }
        for svc in &snapshot.services {
            rm.add_service(svc)?;
        }
        for module in &snapshot.modules {
            rm.add_module(module)?;
        }
        for route in &snapshot.routes {
            rm.add_route(route)?;
        }
        for domain in &snapshot.domains {
            rm.add_domain(domain)?;
        }
        for secret in &snapshot.secrets {
            rm.add_secret(secret)?;
        }
        for collection in &snapshot.collections {
            rm.add_collection(collection)?;
        }
        Ok(rm)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.routes.is_empty()
            && self.modules.is_empty()
            && self.domains.is_empty()
            && self.secrets.is_empty()
            && self.collections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use serde_json::json;

    fn service(name: &str) -> Service {
        Service::new(name, "default", vec!["http://localhost:8080".into()])
    }

    fn route(name: &str, service: Option<&str>) -> Route {
        let mut route = Route::new(name, "default");
        route.paths = vec!["/".into()];
        route.service = service.map(String::from);
        route
    }

    #[test]
    fn test_default_namespace_is_implicit() {
        let rm = ResourceManager::new();
        assert!(rm.get_namespace("default").is_some());
        assert!(rm.is_empty());
    }

    #[test]
    fn test_add_is_upsert() {
        let mut rm = ResourceManager::new();
        rm.add_service(&service("svc1")).unwrap();
        let mut updated = service("svc1");
        updated.retries = Some(7);
        rm.add_service(&updated).unwrap();
        assert_eq!(rm.list_services(None).len(), 1);
        assert_eq!(rm.get_service("default", "svc1").unwrap().retries, 7);
    }

    #[test]
    fn test_route_resolves_service() {
        let mut rm = ResourceManager::new();
        assert!(rm.add_route(&route("r1", Some("svc1"))).is_err());
        rm.add_service(&service("svc1")).unwrap();
        let r = rm.add_route(&route("r1", Some("svc1"))).unwrap();
        assert_eq!(rm.route_service(&r).unwrap().name, "svc1");
    }

    #[test]
    fn test_remove_service_in_use() {
        let mut rm = ResourceManager::new();
        rm.add_service(&service("svc1")).unwrap();
        rm.add_route(&route("r1", Some("svc1"))).unwrap();
        assert!(matches!(
            rm.remove_service("default", "svc1"),
            Err(GatewayError::Conflict { .. })
        ));
        rm.remove_route("default", "r1").unwrap();
        rm.remove_service("default", "svc1").unwrap();
        // tolerant of missing
        rm.remove_service("default", "svc1").unwrap();
    }

    #[test]
    fn test_list_by_namespace_outlives_filter() {
        let mut rm = ResourceManager::new();
        rm.add_namespace(&Namespace::new("team")).unwrap();
        rm.add_service(&service("svc1")).unwrap();
        rm.add_service(&Service::new("svc2", "team", vec!["http://x".into()])).unwrap();
        let listed = {
            let namespace = String::from("team");
            rm.list_services(Some(&namespace))
        };
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "svc2");
        assert_eq!(rm.list_services(None).len(), 2);
    }

    #[test]
    fn test_remove_namespace_in_use() {
        let mut rm = ResourceManager::new();
        rm.add_namespace(&Namespace::new("team")).unwrap();
        rm.add_service(&Service::new("svc", "team", vec!["http://x".into()])).unwrap();
        let err = rm.remove_namespace("team").unwrap_err();
        assert!(err.to_string().contains("cannot delete namespace team"));
        rm.remove_service("team", "svc").unwrap();
        rm.remove_namespace("team").unwrap();
        assert!(rm.get_namespace("team").is_none());
        rm.remove_namespace("team").unwrap();
    }

    #[test]
    fn test_remove_module_in_use() {
        let mut rm = ResourceManager::new();
        rm.add_module(&Module {
            name: "m1".into(),
            namespace: "default".into(),
            payload: base64::engine::general_purpose::STANDARD.encode("1"),
            module_type: Default::default(),
            permissions: vec![],
            tags: vec![],
        })
        .unwrap();
        let mut r = route("r1", None);
        r.modules = vec!["m1".into()];
        let r = rm.add_route(&r).unwrap();
        assert_eq!(rm.route_modules(&r).len(), 1);
        assert!(rm.remove_module("default", "m1").is_err());
    }

    #[test]
    fn test_domains_by_priority() {
        let mut rm = ResourceManager::new();
        for (name, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
            rm.add_domain(&Domain {
                name: name.into(),
                namespace: "default".into(),
                patterns: vec!["*".into()],
                priority,
                cert: String::new(),
                key: String::new(),
                tags: vec![],
            })
            .unwrap();
        }
        let names: Vec<_> = rm.domains_by_priority().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut rm = ResourceManager::new();
        rm.add_namespace(&Namespace::new("team")).unwrap();
        rm.add_service(&service("svc1")).unwrap();
        rm.add_route(&route("r1", Some("svc1"))).unwrap();
        rm.add_secret(&Secret {
            name: "s".into(),
            namespace: "team".into(),
            data: "aGVsbG8".into(),
            tags: vec![],
        })
        .unwrap();
        rm.add_collection(&Collection {
            name: "c".into(),
            namespace: "default".into(),
            schema: json!({"type": "object"}),
            collection_type: Default::default(),
            visibility: Default::default(),
            tags: vec![],
        })
        .unwrap();

        let snapshot = rm.snapshot();
        let encoded = serde_json::to_vec(&snapshot).unwrap();
        let decoded: ResourceSnapshot = serde_json::from_slice(&encoded).unwrap();
        let restored = ResourceManager::from_snapshot(&decoded).unwrap();

        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(
            restored.get_secret("team", "s").unwrap().data.expose_secret(),
            b"hello"
        );
    }
}
