//! # Configuration Settings
//!
//! Defines the configuration structure for a flowgate node.

use crate::errors::{GatewayError, Result};
use crate::resources::{Collection, Document, Domain, Module, Namespace, Route, Secret, Service};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Node identity and flags
    #[validate(nested)]
    pub node: NodeConfig,

    /// Storage backend selection
    pub storage: StorageConfig,

    /// Cluster replication (disabled when absent)
    #[validate(nested)]
    pub replication: Option<ReplicationConfig>,

    /// Data-plane proxy configuration
    #[validate(nested)]
    pub proxy: ProxyConfig,

    /// Admin API address advertised to peers
    #[validate(nested)]
    pub admin: AdminConfig,

    /// Logging configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,

    /// Resources applied at startup
    pub resources: InitResources,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(GatewayError::from)?;
        self.validate_custom()?;
        Ok(())
    }

    fn validate_custom(&self) -> Result<()> {
        if self.storage.kind == StorageKind::File && self.storage.directory.is_none() {
            return Err(GatewayError::validation_field(
                "storage.directory is required when storage.kind is file",
                "storage.directory",
            ));
        }

        if self.proxy.port == self.admin.port && self.proxy.host == self.admin.host {
            return Err(GatewayError::validation(
                "Proxy and admin addresses cannot be the same",
            ));
        }

        if let Some(replication) = &self.replication {
            if replication.heartbeat_ms >= replication.election_timeout_ms {
                return Err(GatewayError::validation_field(
                    "heartbeat must be shorter than the election timeout",
                    "replication.heartbeat_ms",
                ));
            }
        }

        Ok(())
    }

    /// True when this node participates in a replicated cluster.
    pub fn replication_enabled(&self) -> bool {
        self.replication.is_some()
    }
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identifier, also used as the replication id when that is unset
    #[validate(length(min = 1, message = "Node id cannot be empty"))]
    pub id: String,

    /// Enables verbose behaviour useful during development
    pub debug: bool,

    /// Free-form node tags
    pub tags: Vec<String>,

    /// Skip creating the implicit `default` namespace at startup
    pub disable_default_namespace: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "flowgate-0".to_string(),
            debug: false,
            tags: vec![],
            disable_default_namespace: false,
        }
    }
}

/// Storage backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    File,
    Debug,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageKind::Memory => "memory",
            StorageKind::File => "file",
            StorageKind::Debug => "debug",
        })
    }
}

impl std::str::FromStr for StorageKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageKind::Memory),
            "file" => Ok(StorageKind::File),
            "debug" => Ok(StorageKind::Debug),
            other => Err(GatewayError::config(format!("invalid storage type: {}", other))),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind
    pub kind: StorageKind,

    /// Data directory for the file backend
    pub directory: Option<String>,
}

impl StorageConfig {
    /// Create StorageConfig from environment variables
    pub fn from_env() -> Result<Self> {
        let kind = match std::env::var("FLOWGATE_STORAGE_KIND") {
            Ok(value) => value.parse()?,
            Err(_) => StorageKind::Memory,
        };
        let directory = std::env::var("FLOWGATE_STORAGE_DIRECTORY").ok();
        Ok(Self { kind, directory })
    }
}

/// Cluster replication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Replication member id; falls back to `node.id` when empty
    pub id: String,

    /// Key peers must present on replication RPCs
    pub shared_key: Option<String>,

    /// Bootstrap a new cluster when the membership is empty
    pub bootstrap_cluster: bool,

    /// DNS name resolved to discover peers during bootstrap
    pub discovery_domain: Option<String>,

    /// Explicit peer map, member id to replication address
    pub cluster_address: BTreeMap<String, String>,

    /// Address this node listens on for replication RPCs
    #[validate(length(min = 1, message = "Replication bind address cannot be empty"))]
    pub bind_address: String,

    /// Address peers use to reach this node
    #[validate(length(min = 1, message = "Advertised address cannot be empty"))]
    pub advert_address: String,

    /// Scheme used for replication RPCs (`http` or `https`)
    #[validate(length(min = 1, message = "Advert scheme cannot be empty"))]
    pub advert_scheme: String,

    /// How long a submission waits for quorum
    #[validate(range(min = 1, message = "Apply timeout must be positive"))]
    pub apply_timeout_ms: u64,

    /// Follower election timeout
    #[validate(range(min = 10, message = "Election timeout must be at least 10ms"))]
    pub election_timeout_ms: u64,

    /// Leader heartbeat interval
    #[validate(range(min = 1, message = "Heartbeat must be positive"))]
    pub heartbeat_ms: u64,

    /// Number of applied entries after which the log is compacted into a snapshot (0 = never)
    pub snapshot_threshold: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            shared_key: None,
            bootstrap_cluster: true,
            discovery_domain: None,
            cluster_address: BTreeMap::new(),
            bind_address: "0.0.0.0:9090".to_string(),
            advert_address: "127.0.0.1:9090".to_string(),
            advert_scheme: "http".to_string(),
            apply_timeout_ms: 5_000,
            election_timeout_ms: 1_000,
            heartbeat_ms: 100,
            snapshot_threshold: 1_024,
        }
    }
}

impl ReplicationConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Default port used for discovered peers, taken from the advertised address.
    pub fn advert_port(&self) -> Option<u16> {
        self.advert_address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }
}

/// Upstream transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Default retries when a service does not set its own
    pub retries: u32,

    /// Per-attempt timeout (0 = disabled)
    pub request_timeout_ms: u64,

    /// Aggregate retry budget (0 = unbounded)
    pub retry_timeout_ms: u64,

    /// TCP connect timeout (0 = disabled)
    pub connect_timeout_ms: u64,

    /// Response flush interval
    #[validate(range(min = 1, message = "Flush interval must be positive"))]
    pub flush_interval_ms: u64,

    /// Idle pooled connections kept per upstream host
    pub max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            request_timeout_ms: 0,
            retry_timeout_ms: 0,
            connect_timeout_ms: 5_000,
            flush_interval_ms: 100,
            max_idle_per_host: 32,
        }
    }
}

impl TransportConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }
}

/// Data-plane proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy bind host
    #[validate(length(min = 1, message = "Host cannot be empty"))]
    pub host: String,

    /// Proxy port
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Strip `X-Forwarded-*` headers instead of setting them
    pub disable_x_forwarded_headers: bool,

    /// Upstream transport
    #[validate(nested)]
    pub transport: TransportConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            disable_x_forwarded_headers: false,
            transport: TransportConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Get the proxy bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Admin API address configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AdminConfig {
    #[validate(length(min = 1, message = "Admin host cannot be empty"))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Admin URL advertised to followers for redirects
    pub advert_address: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9080,
            advert_address: None,
        }
    }
}

impl AdminConfig {
    /// Advertised admin address, defaulting to `http://host:port`.
    pub fn advertised(&self) -> String {
        self.advert_address
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Service name recorded on every log line
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "flowgate".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
        }
    }
}

impl ObservabilityConfig {
    /// Create ObservabilityConfig from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("FLOWGATE_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: std::env::var("FLOWGATE_LOG_LEVEL").unwrap_or(defaults.log_level),
            json_logging: std::env::var("FLOWGATE_LOG_JSON")
                .map(|s| s.to_lowercase() == "true" || s == "1")
                .unwrap_or(defaults.json_logging),
        }
    }
}

/// Resources applied when the node starts.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct InitResources {
    pub namespaces: Vec<Namespace>,
    pub services: Vec<Service>,
    pub routes: Vec<Route>,
    pub modules: Vec<Module>,
    pub domains: Vec<Domain>,
    pub secrets: Vec<Secret>,
    pub collections: Vec<Collection>,
    pub documents: Vec<Document>,
}

impl InitResources {
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
            && self.services.is_empty()
            && self.routes.is_empty()
            && self.modules.is_empty()
            && self.domains.is_empty()
            && self.secrets.is_empty()
            && self.collections.is_empty()
            && self.documents.is_empty()
    }
}
