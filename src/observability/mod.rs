//! # Observability Infrastructure
//!
//! Structured logging for flowgate nodes: subscriber setup, span macros and startup
//! configuration logging.

pub mod logging;

pub use logging::{init_logging, log_config_info};

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use ::tracing::info;

/// Initialize logging for the process.
pub fn init_observability(config: &ObservabilityConfig) -> Result<()> {
    init_logging(config)?;

    info!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        json_logging = config.json_logging,
        "Observability initialized successfully"
    );

    Ok(())
}
