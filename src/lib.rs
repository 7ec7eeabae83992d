//! # Flowgate
//!
//! Core of a distributed HTTP API gateway. Every mutation of the resource graph
//! (namespaces, services, routes, modules, domains, secrets, collections and documents) is
//! recorded as a change log. Change logs are persisted locally or replicated through a
//! leader-based log, then applied to an in-memory resource graph that the data plane turns
//! into reverse proxies.
//!
//! ## Architecture
//!
//! ```text
//! Admin Client → Change Log → Store (storage | replicated log) → State Manager
//!                                                                     ↓
//!                                 Upstreams ← Reverse Proxy ← Routing Table
//! ```
//!
//! ## Core Components
//!
//! - **Resources**: external/internal forms and the [`resources::ResourceManager`] graph
//! - **Change logs**: commands, IDs and compaction
//! - **Store**: persistence and replication of change logs and documents
//! - **State**: applies change logs and publishes revisions
//! - **Proxy**: retrying transport, reverse-proxy builder and the data-plane server
//! - **Client**: typed admin API client
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowgate::{config, state::{GatewayState, StateOptions}, store::Store, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = config::load(None)?;
//!     let store = Arc::new(Store::from_config(&config).await?);
//!     let state = GatewayState::new(store, StateOptions::from(&config.node));
//!     state.start().await?;
//!     state.shutdown().await
//! }
//! ```

pub mod changelog;
pub mod client;
pub mod config;
pub mod consensus;
pub mod errors;
pub mod observability;
pub mod proxy;
pub mod resources;
pub mod state;
pub mod storage;
pub mod store;

pub use config::AppConfig;
pub use errors::{GatewayError, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "flowgate");
    }
}
