//! Cluster member discovery for bootstrap.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::errors::{GatewayError, Result};

/// Build the bootstrap member map.
///
/// Starts from the explicit `addresses` and, when a discovery domain is set, adds every
/// address it resolves to as `<ip> -> <ip>:<port>`. Explicit entries win over discovered ones.
pub async fn parse_cluster(
    addresses: &BTreeMap<String, String>,
    discovery_domain: Option<&str>,
    port: u16,
) -> Result<BTreeMap<String, String>> {
    let mut members = addresses.clone();
    let Some(domain) = discovery_domain.filter(|d| !d.is_empty()) else {
        return Ok(members);
    };

    let resolved = tokio::net::lookup_host((domain, port)).await.map_err(|e| {
        GatewayError::config_with_source(
            format!("failed to resolve discovery domain {}", domain),
            Box::new(e),
        )
    })?;

    for addr in resolved {
        let host = addr.ip().to_string();
        debug!(domain = %domain, host = %host, "discovered cluster member");
        members
            .entry(host.clone())
            .or_insert_with(|| format!("{}:{}", host, port));
    }
    info!(domain = %domain, members = members.len(), "cluster discovery finished");
    Ok(members)
}
