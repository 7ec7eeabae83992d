//! Conversions between external and internal resource forms.
//!
//! External → internal resolves references through a [`Resolver`] and fails with a typed
//! not-found error when a peer is missing. Internal → external re-encodes payloads to
//! base64, writes peers back by name and redacts secret data.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use std::time::Duration;
use url::Url;
use validator::Validate;
use x509_parser::pem::parse_x509_pem;

use super::external::{
    Collection, CollectionType, Document, Domain, Module, Namespace, Route, Secret, Service,
    REDACTED,
};
use super::internal::{
    CertificateInfo, CompiledSchema, GatewayCollection, GatewayDocument, GatewayDomain,
    GatewayModule, GatewayNamespace, GatewayRoute, GatewaySecret, GatewayService, ResourceKey,
};
use super::secret::SecretBytes;
use crate::changelog::Resource;
use crate::errors::{GatewayError, Result};

pub const DEFAULT_RETRIES: u32 = 3;

/// Lookup surface used while resolving references.
pub trait Resolver {
    fn has_namespace(&self, name: &str) -> bool;
    fn has_service(&self, key: &ResourceKey) -> bool;
    fn has_module(&self, key: &ResourceKey) -> bool;
    fn collection(&self, key: &ResourceKey) -> Option<&GatewayCollection>;
}

fn require_namespace(resolver: &impl Resolver, namespace: &str) -> Result<()> {
    if resolver.has_namespace(namespace) {
        Ok(())
    } else {
        Err(GatewayError::not_found(Resource::Namespace, namespace))
    }
}

pub fn namespace_to_internal(ns: &Namespace) -> Result<GatewayNamespace> {
    ns.validate()?;
    Ok(GatewayNamespace {
        name: ns.name.clone(),
        tags: ns.tags.clone(),
    })
}

pub fn service_to_internal(svc: &Service, resolver: &impl Resolver) -> Result<GatewayService> {
    svc.validate()?;
    require_namespace(resolver, &svc.namespace)?;
    let urls = svc
        .urls
        .iter()
        .map(|raw| {
            Url::parse(raw).map_err(|e| {
                GatewayError::validation_field(format!("invalid url {:?}: {}", raw, e), "urls")
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(GatewayService {
        name: svc.name.clone(),
        namespace: svc.namespace.clone(),
        urls,
        retries: svc.retries.unwrap_or(DEFAULT_RETRIES),
        retry_timeout: svc.retry_timeout.unwrap_or(Duration::ZERO),
        connect_timeout: svc.connect_timeout.unwrap_or(Duration::ZERO),
        request_timeout: svc.request_timeout.unwrap_or(Duration::ZERO),
        tls_skip_verify: svc.tls_skip_verify.unwrap_or(false),
        http2_only: svc.http2_only.unwrap_or(false),
        hide_gateway_headers: svc.hide_gateway_headers.unwrap_or(false),
        disable_query_params: svc.disable_query_params.unwrap_or(false),
        tags: svc.tags.clone(),
    })
}

pub fn route_to_internal(route: &Route, resolver: &impl Resolver) -> Result<GatewayRoute> {
    route.validate()?;
    require_namespace(resolver, &route.namespace)?;

    let service = match route.service.as_deref().filter(|s| !s.is_empty()) {
        Some(name) => {
            let key = ResourceKey::new(&route.namespace, name);
            if !resolver.has_service(&key) {
                return Err(GatewayError::not_found(Resource::Service, name));
            }
            Some(key)
        }
        None => None,
    };

    let modules = route
        .modules
        .iter()
        .map(|name| {
            let key = ResourceKey::new(&route.namespace, name);
            if resolver.has_module(&key) {
                Ok(key)
            } else {
                Err(GatewayError::not_found(Resource::Module, name))
            }
        })
        .collect::<Result<Vec<_>>>()?;

    if route.methods.iter().any(|m| m == "*") && route.methods.len() > 1 {
        return Err(GatewayError::validation_field(
            "route methods cannot have other methods with *",
            "methods",
        ));
    }

    Ok(GatewayRoute {
        name: route.name.clone(),
        namespace: route.namespace.clone(),
        paths: route.paths.clone(),
        methods: route.methods.iter().map(|m| m.to_uppercase()).collect(),
        schemes: route.schemes.clone(),
        preserve_host: route.preserve_host,
        strip_path: route.strip_path,
        service,
        modules,
        tags: route.tags.clone(),
    })
}

pub fn module_to_internal(module: &Module, resolver: &impl Resolver) -> Result<GatewayModule> {
    module.validate()?;
    require_namespace(resolver, &module.namespace)?;
    let bytes = STANDARD.decode(module.payload.as_bytes()).map_err(|e| {
        GatewayError::validation_field(format!("module payload is not valid base64: {}", e), "payload")
    })?;
    let source = String::from_utf8(bytes).map_err(|_| {
        GatewayError::validation_field("module payload is not valid utf-8", "payload")
    })?;

    Ok(GatewayModule {
        name: module.name.clone(),
        namespace: module.namespace.clone(),
        source,
        module_type: module.module_type,
        permissions: module.permissions.clone(),
        tags: module.tags.clone(),
    })
}

pub fn domain_to_internal(domain: &Domain, resolver: &impl Resolver) -> Result<GatewayDomain> {
    domain.validate()?;
    require_namespace(resolver, &domain.namespace)?;
    let certificate = if domain.cert.trim().is_empty() {
        None
    } else {
        Some(parse_certificate(&domain.cert)?)
    };
    if certificate.is_some() && domain.key.trim().is_empty() {
        return Err(GatewayError::validation_field("domain cert requires a key", "key"));
    }

    Ok(GatewayDomain {
        name: domain.name.clone(),
        namespace: domain.namespace.clone(),
        patterns: domain.patterns.clone(),
        priority: domain.priority,
        cert_pem: domain.cert.clone(),
        key_pem: SecretBytes::new(domain.key.clone().into_bytes()),
        certificate,
        tags: domain.tags.clone(),
    })
}

/// Parse the first certificate of a PEM bundle.
pub fn parse_certificate(pem: &str) -> Result<CertificateInfo> {
    let invalid = |msg: String| GatewayError::validation_field(msg, "cert");
    let (_, pem) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| invalid(format!("invalid certificate pem: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| invalid(format!("invalid certificate: {}", e)))?;
    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    })
}

/// Secret data accepts padded or unpadded standard base64.
pub fn secret_to_internal(secret: &Secret, resolver: &impl Resolver) -> Result<GatewaySecret> {
    secret.validate()?;
    require_namespace(resolver, &secret.namespace)?;
    let raw = secret.data.trim_end_matches('=');
    let data = STANDARD_NO_PAD.decode(raw.as_bytes()).map_err(|e| {
        GatewayError::validation_field(format!("secret data is not valid base64: {}", e), "data")
    })?;

    Ok(GatewaySecret {
        name: secret.name.clone(),
        namespace: secret.namespace.clone(),
        data: SecretBytes::new(data),
        tags: secret.tags.clone(),
    })
}

pub fn collection_to_internal(
    collection: &Collection,
    resolver: &impl Resolver,
) -> Result<GatewayCollection> {
    collection.validate()?;
    require_namespace(resolver, &collection.namespace)?;
    let compiled = if collection.schema.is_null() {
        None
    } else {
        let validator = jsonschema::validator_for(&collection.schema).map_err(|e| {
            GatewayError::validation_field(format!("invalid collection schema: {}", e), "schema")
        })?;
        Some(CompiledSchema(std::sync::Arc::new(validator)))
    };

    Ok(GatewayCollection {
        name: collection.name.clone(),
        namespace: collection.namespace.clone(),
        schema: collection.schema.clone(),
        compiled,
        collection_type: collection.collection_type,
        visibility: collection.visibility,
        tags: collection.tags.clone(),
    })
}

/// Resolve a document's collection and validate its data against the collection schema.
pub fn document_to_internal(doc: &Document, resolver: &impl Resolver) -> Result<GatewayDocument> {
    doc.validate()?;
    require_namespace(resolver, &doc.namespace)?;
    let key = ResourceKey::new(&doc.namespace, &doc.collection);
    let collection = resolver
        .collection(&key)
        .ok_or_else(|| GatewayError::not_found(Resource::Collection, &doc.collection))?;

    if collection.collection_type == CollectionType::Document {
        if let Some(schema) = &collection.compiled {
            let errors = schema.errors(&doc.data);
            if !errors.is_empty() {
                return Err(GatewayError::validation_field(
                    format!("document does not match collection schema: {}", errors.join("; ")),
                    "data",
                ));
            }
        }
    }

    Ok(GatewayDocument {
        id: doc.id.clone(),
        namespace: doc.namespace.clone(),
        collection: key,
        created_at: doc.created_at,
        updated_at: doc.updated_at,
        data: serde_json::to_string(&doc.data)?,
    })
}

impl From<&GatewayNamespace> for Namespace {
    fn from(ns: &GatewayNamespace) -> Self {
        Namespace {
            name: ns.name.clone(),
            tags: ns.tags.clone(),
        }
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

impl From<&GatewayService> for Service {
    fn from(svc: &GatewayService) -> Self {
        Service {
            name: svc.name.clone(),
            urls: svc.urls.iter().map(|u| u.to_string()).collect(),
            namespace: svc.namespace.clone(),
            retries: Some(svc.retries),
            retry_timeout: non_zero(svc.retry_timeout),
            connect_timeout: non_zero(svc.connect_timeout),
            request_timeout: non_zero(svc.request_timeout),
            tls_skip_verify: Some(svc.tls_skip_verify),
            http2_only: Some(svc.http2_only),
            hide_gateway_headers: Some(svc.hide_gateway_headers),
            disable_query_params: Some(svc.disable_query_params),
            tags: svc.tags.clone(),
        }
    }
}

impl From<&GatewayRoute> for Route {
    fn from(route: &GatewayRoute) -> Self {
        Route {
            name: route.name.clone(),
            paths: route.paths.clone(),
            methods: route.methods.clone(),
            schemes: route.schemes.clone(),
            preserve_host: route.preserve_host,
            strip_path: route.strip_path,
            service: route.service.as_ref().map(|k| k.name.clone()),
            namespace: route.namespace.clone(),
            modules: route.modules.iter().map(|k| k.name.clone()).collect(),
            tags: route.tags.clone(),
        }
    }
}

impl From<&GatewayModule> for Module {
    fn from(module: &GatewayModule) -> Self {
        Module {
            name: module.name.clone(),
            namespace: module.namespace.clone(),
            payload: STANDARD.encode(module.source.as_bytes()),
            module_type: module.module_type,
            permissions: module.permissions.clone(),
            tags: module.tags.clone(),
        }
    }
}

impl From<&GatewayDomain> for Domain {
    fn from(domain: &GatewayDomain) -> Self {
        Domain {
            name: domain.name.clone(),
            namespace: domain.namespace.clone(),
            patterns: domain.patterns.clone(),
            priority: domain.priority,
            cert: domain.cert_pem.clone(),
            key: if domain.key_pem.is_empty() {
                String::new()
            } else {
                REDACTED.to_string()
            },
            tags: domain.tags.clone(),
        }
    }
}

impl From<&GatewaySecret> for Secret {
    fn from(secret: &GatewaySecret) -> Self {
        Secret {
            name: secret.name.clone(),
            namespace: secret.namespace.clone(),
            data: REDACTED.to_string(),
            tags: secret.tags.clone(),
        }
    }
}

impl From<&GatewayCollection> for Collection {
    fn from(col: &GatewayCollection) -> Self {
        Collection {
            name: col.name.clone(),
            namespace: col.namespace.clone(),
            schema: col.schema.clone(),
            collection_type: col.collection_type,
            visibility: col.visibility,
            tags: col.tags.clone(),
        }
    }
}

impl TryFrom<&GatewayDocument> for Document {
    type Error = GatewayError;

    fn try_from(doc: &GatewayDocument) -> Result<Self> {
        Ok(Document {
            id: doc.id.clone(),
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            namespace: doc.namespace.clone(),
            collection: doc.collection.name.clone(),
            data: serde_json::from_str(&doc.data)?,
        })
    }
}

/// Unredacted external forms, used only for snapshots that must carry secret material.
pub fn secret_to_snapshot(secret: &GatewaySecret) -> Secret {
    Secret {
        data: STANDARD.encode(secret.data.expose_secret()),
        ..Secret::from(secret)
    }
}

pub fn domain_to_snapshot(domain: &GatewayDomain) -> Domain {
    Domain {
        key: String::from_utf8_lossy(domain.key_pem.expose_secret()).into_owned(),
        ..Domain::from(domain)
    }
}
