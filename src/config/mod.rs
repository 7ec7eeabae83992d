//! # Configuration Management
//!
//! Configuration is layered: built-in defaults, then an optional file (YAML, TOML or JSON,
//! chosen by extension), then `FLOWGATE__`-prefixed environment variables using `__` as the
//! nesting separator (`FLOWGATE__PROXY__PORT=8081`). The merged result is validated before
//! it is returned.

pub mod settings;

pub use settings::{
    AdminConfig, AppConfig, InitResources, NodeConfig, ObservabilityConfig, ProxyConfig,
    ReplicationConfig, StorageConfig, StorageKind, TransportConfig,
};

use std::path::Path;

use crate::errors::{GatewayError, Result};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "FLOWGATE";

/// Load and validate configuration from defaults, an optional file and the environment.
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let defaults = config::Config::try_from(&AppConfig::default())?;
    let mut builder = config::Config::builder().add_source(defaults);

    if let Some(path) = path {
        if !path.exists() {
            return Err(GatewayError::config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path));
    }

    let merged = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app: AppConfig = merged.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_defaults_without_file() {
        let config = load(None).unwrap();
        assert_eq!(config.storage.kind, StorageKind::Memory);
        assert_eq!(config.proxy.port, 8080);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
node:
  id: node-a
storage:
  kind: file
  directory: /tmp/flowgate-test
proxy:
  port: 8181
  transport:
    retries: 5
replication:
  id: node-a
  bootstrap_cluster: true
  cluster_address:
    node-b: 10.0.0.2:9090
resources:
  namespaces:
    - name: payments
      tags: [team-a]
"#
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.node.id, "node-a");
        assert_eq!(config.storage.kind, StorageKind::File);
        assert_eq!(config.proxy.port, 8181);
        assert_eq!(config.proxy.transport.retries, 5);
        let replication = config.replication.unwrap();
        assert_eq!(
            replication.cluster_address.get("node-b").map(String::as_str),
            Some("10.0.0.2:9090")
        );
        assert_eq!(config.resources.namespaces[0].name, "payments");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "storage:\n  kind: file\n").unwrap();
        assert!(load(Some(file.path())).is_err());
    }
}
