//! # Resource Model
//!
//! Typed gateway configuration entities in two parallel representations:
//!
//! - **external** forms ([`external`]) are flat JSON documents that reference peers by
//!   name. They travel in change logs, admin payloads and client responses.
//! - **internal** forms ([`internal`]) hold resolved keys, parsed URLs, compiled JSON
//!   Schemas, decoded module source and secret bytes.
//!
//! [`transform`] converts between the two and [`ResourceManager`] owns the live graph.

pub mod duration;
pub mod external;
pub mod internal;
pub mod manager;
pub mod secret;
pub mod transform;

pub use external::{
    Collection, CollectionType, CollectionVisibility, Document, Domain, Module, ModuleType,
    Named, Namespace, Route, Secret, Service, DEFAULT_NAMESPACE, REDACTED,
};
pub use internal::{
    GatewayCollection, GatewayDocument, GatewayDomain, GatewayModule, GatewayNamespace,
    GatewayRoute, GatewaySecret, GatewayService, ResourceKey,
};
pub use manager::{ResourceManager, ResourceSnapshot};
pub use secret::SecretBytes;
