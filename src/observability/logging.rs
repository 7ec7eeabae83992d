//! # Structured Logging
//!
//! Span macros and logging setup built on the tracing ecosystem.
//!
//! In JSON mode every line carries the current span and span list, so a request id or
//! replication term recorded on a span shows up on every event emitted inside it.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::{AppConfig, ObservabilityConfig};
use crate::errors::{GatewayError, Result};

/// Create a tracing span for proxied requests.
///
/// ```rust,ignore
/// let span = request_span!("GET", "/users/1", route = "users");
/// ```
#[macro_export]
macro_rules! request_span {
    ($method:expr, $path:expr) => {
        tracing::info_span!(
            "http_request",
            method = %$method,
            path = %$path,
            request_id = %uuid::Uuid::new_v4()
        )
    };
    ($method:expr, $path:expr, $($field:tt)*) => {
        tracing::info_span!(
            "http_request",
            method = %$method,
            path = %$path,
            request_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for storage operations.
#[macro_export]
macro_rules! storage_span {
    ($operation:expr) => {
        tracing::debug_span!(
            "storage_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "storage_operation",
            operation = %$operation,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for replication work on a node.
#[macro_export]
macro_rules! raft_span {
    ($operation:expr, $node_id:expr) => {
        tracing::debug_span!(
            "raft_operation",
            operation = %$operation,
            node_id = %$node_id
        )
    };
    ($operation:expr, $node_id:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "raft_operation",
            operation = %$operation,
            node_id = %$node_id,
            $($field)*
        )
    };
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            GatewayError::config_with_source(
                format!("invalid log level: {}", config.log_level),
                Box::new(e),
            )
        })?;

    let registry = Registry::default().with(filter);
    let result = if config.json_logging {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()
    } else {
        registry.with(fmt::layer().compact().with_target(true)).try_init()
    };

    result.map_err(|e| {
        GatewayError::config_with_source("failed to install tracing subscriber", Box::new(e))
    })
}

/// Log configuration at startup
pub fn log_config_info(config: &AppConfig) {
    tracing::info!(
        node_id = %config.node.id,
        storage_kind = %config.storage.kind,
        storage_directory = ?config.storage.directory,
        proxy_address = %config.proxy.bind_address(),
        admin_address = %config.admin.advertised(),
        replication_enabled = config.replication_enabled(),
        retries = config.proxy.transport.retries,
        "flowgate node configuration"
    );
    if let Some(replication) = &config.replication {
        tracing::info!(
            replication_id = %replication.id,
            advert_address = %replication.advert_address,
            bootstrap_cluster = replication.bootstrap_cluster,
            peers = replication.cluster_address.len(),
            discovery_domain = ?replication.discovery_domain,
            "replication configuration"
        );
    }
}
