//! # Data Plane
//!
//! Request forwarding for the gateway:
//!
//! - [`transport`]: upstream round-trippers with bounded retries and timeouts
//! - [`reverse_proxy`]: per-route reverse proxy with the rewrite pipeline
//! - [`pattern`]: host patterns used by domains
//! - [`router`]: routing table built from the resource graph
//! - [`server`]: the axum server that serves it

pub mod pattern;
pub mod reverse_proxy;
pub mod router;
pub mod server;
pub mod transport;

pub use reverse_proxy::{ClientUpgrade, InboundRequest, OutboundRequest, ReverseProxy, ReverseProxyBuilder};
pub use router::{ClientCache, RouterOptions, RoutingTable};
pub use server::DataPlane;
pub use transport::{upgrade_protocol, HttpClientTransport, RoundTrip, TransportBuilder, UpstreamUpgrade};
