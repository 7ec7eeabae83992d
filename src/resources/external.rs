//! External (wire/admin-facing) resource forms.
//!
//! These are flat JSON documents that reference peers by name. They are the payload of
//! change-log items, admin API bodies and admin client responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use validator::{Validate, ValidationError};

use super::duration;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Placeholder returned instead of secret data.
pub const REDACTED: &str = "**redacted**";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Namespace {
    #[validate(
        length(min = 1, message = "Namespace name cannot be empty"),
        custom(function = "validate_resource_name")
    )]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
        }
    }

    pub fn default_namespace() -> Self {
        Self {
            name: DEFAULT_NAMESPACE.to_string(),
            tags: vec![DEFAULT_NAMESPACE.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[validate(
        length(min = 1, message = "Service name cannot be empty"),
        custom(function = "validate_resource_name")
    )]
    pub name: String,
    #[validate(length(min = 1, message = "Service must have at least one url"))]
    pub urls: Vec<String>,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub retry_timeout: Option<Duration>,
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Duration>,
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_skip_verify: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http2_only: Option<bool>,
    #[serde(default, rename = "hideDGateHeaders", skip_serializing_if = "Option::is_none")]
    pub hide_gateway_headers: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_query_params: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Service {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            name: name.into(),
            urls,
            namespace: namespace.into(),
            retries: None,
            retry_timeout: None,
            connect_timeout: None,
            request_timeout: None,
            tls_skip_verify: None,
            http2_only: None,
            hide_gateway_headers: None,
            disable_query_params: None,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[validate(
        length(min = 1, message = "Route name cannot be empty"),
        custom(function = "validate_resource_name")
    )]
    pub name: String,
    #[validate(length(min = 1, message = "Route must have at least one path"))]
    pub paths: Vec<String>,
    #[validate(length(min = 1, message = "Route must have at least one method"))]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schemes: Vec<String>,
    #[serde(default)]
    pub preserve_host: bool,
    #[serde(default)]
    pub strip_path: bool,
    #[serde(default, rename = "service", skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Route {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            paths: Vec::new(),
            methods: vec!["*".to_string()],
            schemes: Vec::new(),
            preserve_host: false,
            strip_path: false,
            service: None,
            namespace: namespace.into(),
            modules: Vec::new(),
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    #[default]
    Javascript,
    Typescript,
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleType::Javascript => f.write_str("javascript"),
            ModuleType::Typescript => f.write_str("typescript"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    #[validate(
        length(min = 1, message = "Module name cannot be empty"),
        custom(function = "validate_resource_name")
    )]
    pub name: String,
    pub namespace: String,
    /// Base64 (standard alphabet) encoded module source
    pub payload: String,
    #[serde(default)]
    pub module_type: ModuleType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Domain {
    #[validate(
        length(min = 1, message = "Domain name cannot be empty"),
        custom(function = "validate_resource_name")
    )]
    pub name: String,
    pub namespace: String,
    #[validate(length(min = 1, message = "Domain must have at least one pattern"))]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Secret {
    #[validate(
        length(min = 1, message = "Secret name cannot be empty"),
        custom(function = "validate_resource_name")
    )]
    pub name: String,
    pub namespace: String,
    /// Base64 encoded on input, redacted on output
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    #[default]
    Document,
    Fetcher,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionVisibility {
    Public,
    #[default]
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Collection {
    #[validate(
        length(min = 1, message = "Collection name cannot be empty"),
        custom(function = "validate_resource_name")
    )]
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub schema: serde_json::Value,
    #[serde(default, rename = "type")]
    pub collection_type: CollectionType,
    #[serde(default)]
    pub visibility: CollectionVisibility,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[validate(
        length(min = 1, message = "Document id cannot be empty"),
        custom(function = "validate_resource_name")
    )]
    pub id: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    pub namespace: String,
    pub collection: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        namespace: impl Into<String>,
        collection: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            namespace: namespace.into(),
            collection: collection.into(),
            data,
        }
    }
}

/// Names are storage key segments and may not contain `/`.
pub fn validate_resource_name(name: &str) -> Result<(), ValidationError> {
    if name.contains('/') {
        return Err(ValidationError::new("invalid_resource_name")
            .with_message("name cannot contain '/'".into()));
    }
    Ok(())
}

/// Identity shared by all external forms.
pub trait Named {
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
}

macro_rules! impl_named {
    ($($ty:ty),*) => {
        $(impl Named for $ty {
            fn name(&self) -> &str {
                &self.name
            }

            fn namespace(&self) -> &str {
                &self.namespace
            }
        })*
    };
}

impl_named!(Service, Route, Module, Domain, Secret, Collection);

impl Named for Namespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.name
    }
}

impl Named for Document {
    fn name(&self) -> &str {
        &self.id
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_wire_names() {
        let svc: Service = serde_json::from_value(json!({
            "name": "svc1",
            "namespace": "default",
            "urls": ["http://localhost:8080"],
            "retries": 5,
            "requestTimeout": "2s",
            "hideDGateHeaders": true,
            "disableQueryParams": false
        }))
        .unwrap();
        assert_eq!(svc.retries, Some(5));
        assert_eq!(svc.request_timeout, Some(Duration::from_secs(2)));
        assert_eq!(svc.hide_gateway_headers, Some(true));
        assert_eq!(svc.tls_skip_verify, None);

        let value = serde_json::to_value(&svc).unwrap();
        assert_eq!(value["requestTimeout"], "2s");
        assert!(value.get("retryTimeout").is_none());
    }

    #[test]
    fn test_route_requires_paths_and_methods() {
        let mut route = Route::new("r1", "default");
        assert!(route.validate().is_err());
        route.paths.push("/test/*".to_string());
        assert!(route.validate().is_ok());
        route.methods.clear();
        assert!(route.validate().is_err());
    }

    #[test]
    fn test_route_wire_names() {
        let route: Route = serde_json::from_value(json!({
            "name": "r1",
            "namespace": "default",
            "paths": ["/"],
            "methods": ["GET"],
            "stripPath": true,
            "service": "svc1",
            "modules": ["m1"]
        }))
        .unwrap();
        assert!(route.strip_path);
        assert!(!route.preserve_host);
        assert_eq!(route.service.as_deref(), Some("svc1"));
        assert_eq!(route.modules, vec!["m1"]);
    }

    #[test]
    fn test_enums_lowercase() {
        let module: Module = serde_json::from_value(json!({
            "name": "m1", "namespace": "default", "payload": "", "moduleType": "typescript"
        }))
        .unwrap();
        assert_eq!(module.module_type, ModuleType::Typescript);

        let col: Collection = serde_json::from_value(json!({
            "name": "c1", "namespace": "default", "type": "fetcher", "visibility": "public"
        }))
        .unwrap();
        assert_eq!(col.collection_type, CollectionType::Fetcher);
        assert_eq!(col.visibility, CollectionVisibility::Public);
    }

    #[test]
    fn test_names_reject_slash() {
        let mut svc = Service::new("users/archive", "default", vec!["http://localhost".to_string()]);
        let err = crate::errors::GatewayError::from(svc.validate().unwrap_err());
        assert!(err.to_string().contains("name cannot contain '/'"));
        svc.name = "users".to_string();
        assert!(svc.validate().is_ok());

        let doc = Document::new("a/b", "default", "users", json!({}));
        assert!(doc.validate().is_err());
        assert!(Namespace::new("team/x").validate().is_err());
    }

    #[test]
    fn test_default_namespace() {
        let ns = Namespace::default_namespace();
        assert_eq!(ns.name, "default");
        assert_eq!(ns.namespace(), "default");
    }
}
