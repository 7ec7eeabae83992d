//! Internal (runtime) resource forms.
//!
//! Peers are referenced by [`ResourceKey`] and resolved through the
//! [`ResourceManager`](super::ResourceManager) on read, so the graph holds no ownership
//! cycles and can be rebuilt by replaying change logs in any consistent order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::external::{CollectionType, CollectionVisibility, ModuleType};
use super::secret::SecretBytes;

/// `(namespace, name)` identity of a namespaced resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayNamespace {
    pub name: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayService {
    pub name: String,
    pub namespace: String,
    pub urls: Vec<Url>,
    pub retries: u32,
    pub retry_timeout: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub tls_skip_verify: bool,
    pub http2_only: bool,
    pub hide_gateway_headers: bool,
    pub disable_query_params: bool,
    pub tags: Vec<String>,
}

impl GatewayService {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRoute {
    pub name: String,
    pub namespace: String,
    pub paths: Vec<String>,
    pub methods: Vec<String>,
    pub schemes: Vec<String>,
    pub preserve_host: bool,
    pub strip_path: bool,
    pub service: Option<ResourceKey>,
    pub modules: Vec<ResourceKey>,
    pub tags: Vec<String>,
}

impl GatewayRoute {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }

    /// True when the route accepts `method`; `*` accepts everything.
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods
            .iter()
            .any(|m| m == "*" || m.eq_ignore_ascii_case(method))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayModule {
    pub name: String,
    pub namespace: String,
    /// Decoded module source
    pub source: String,
    pub module_type: ModuleType,
    pub permissions: Vec<String>,
    pub tags: Vec<String>,
}

/// Metadata extracted from a domain's PEM certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: i64,
    pub not_after: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayDomain {
    pub name: String,
    pub namespace: String,
    pub patterns: Vec<String>,
    pub priority: i32,
    pub cert_pem: String,
    pub key_pem: SecretBytes,
    pub certificate: Option<CertificateInfo>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySecret {
    pub name: String,
    pub namespace: String,
    pub data: SecretBytes,
    pub tags: Vec<String>,
}

/// A compiled JSON Schema shared between collection clones.
#[derive(Clone)]
pub struct CompiledSchema(pub Arc<jsonschema::Validator>);

impl CompiledSchema {
    /// Collect every validation failure for `instance` as strings.
    pub fn errors(&self, instance: &serde_json::Value) -> Vec<String> {
        self.0.iter_errors(instance).map(|e| e.to_string()).collect()
    }
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompiledSchema")
    }
}

#[derive(Debug, Clone)]
pub struct GatewayCollection {
    pub name: String,
    pub namespace: String,
    pub schema: serde_json::Value,
    pub compiled: Option<CompiledSchema>,
    pub collection_type: CollectionType,
    pub visibility: CollectionVisibility,
    pub tags: Vec<String>,
}

impl PartialEq for GatewayCollection {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.namespace == other.namespace
            && self.schema == other.schema
            && self.collection_type == other.collection_type
            && self.visibility == other.visibility
            && self.tags == other.tags
    }
}

/// Runtime document; `data` holds the serialized JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayDocument {
    pub id: String,
    pub namespace: String,
    pub collection: ResourceKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: String,
}
