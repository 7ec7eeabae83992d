//! # Change Logs
//!
//! A [`ChangeLog`] records a single configuration mutation. Change logs are created on the
//! leader, replicated through consensus and applied in id order on every node.
//!
//! The wire form is JSON:
//!
//! ```json
//! {"id":"...","cmd":"add_route","name":"r1","namespace":"default","item":{...},"version":1}
//! ```

pub mod command;
pub mod compaction;
pub mod id;

pub use command::{Action, Command, Resource};
pub use compaction::compact;
pub use id::{next_id, IdGenerator};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::errors::{GatewayError, Result};

/// Current change-log wire version.
pub const CHANGELOG_VERSION: u32 = 1;

/// Storage prefix for persisted change logs.
pub const CHANGELOG_PREFIX: &str = "changelog/";

/// Outcome delivered on a change log's error channel.
pub type ApplyResult = std::result::Result<(), String>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangeLog {
    pub id: String,
    pub cmd: Command,
    pub name: String,
    pub namespace: String,
    pub item: serde_json::Value,
    pub version: u32,
    #[serde(skip)]
    err_tx: Option<oneshot::Sender<ApplyResult>>,
}

impl ChangeLog {
    /// Create a change log for `item` with a freshly generated id.
    ///
    /// An empty namespace is an error except for namespace commands and the
    /// noop/shutdown/restart commands.
    pub fn new<T: Serialize>(
        cmd: Command,
        namespace: impl Into<String>,
        name: impl Into<String>,
        item: &T,
    ) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() && !matches!(cmd.resource(), None | Some(Resource::Namespace)) {
            return Err(GatewayError::validation_field(
                "change log namespace cannot be empty",
                "namespace",
            ));
        }
        let item = serde_json::to_value(item)
            .map_err(|e| GatewayError::serialization("failed to encode change log item", e))?;
        Ok(Self::with_id(next_id(), cmd, namespace, name, item))
    }

    /// A noop change log used to trigger reloads and flush the apply pipeline.
    pub fn noop() -> Self {
        Self::with_id(next_id(), Command::Noop, "", "", serde_json::Value::Null)
    }

    pub fn with_id(
        id: impl Into<String>,
        cmd: Command,
        namespace: impl Into<String>,
        name: impl Into<String>,
        item: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            cmd,
            name: name.into(),
            namespace: namespace.into(),
            item,
            version: CHANGELOG_VERSION,
            err_tx: None,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| GatewayError::serialization("failed to decode change log", e))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| GatewayError::serialization("failed to encode change log", e))
    }

    /// Decode the item payload into its external resource form.
    pub fn decode_item<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.item.clone()).map_err(|e| {
            GatewayError::serialization(format!("failed to decode {} item", self.cmd), e)
        })
    }

    pub fn storage_key(&self) -> String {
        format!("{}{}", CHANGELOG_PREFIX, self.id)
    }

    /// Attach a fresh single-use error channel and return its receiving end.
    /// Any previously attached sender is dropped.
    pub fn error_channel(&mut self) -> oneshot::Receiver<ApplyResult> {
        let (tx, rx) = oneshot::channel();
        self.err_tx = Some(tx);
        rx
    }

    pub fn has_error_channel(&self) -> bool {
        self.err_tx.is_some()
    }

    /// Deliver the apply outcome to whoever holds the receiving end. Subsequent calls are no-ops.
    pub fn push_error(&mut self, outcome: std::result::Result<(), &GatewayError>) {
        if let Some(tx) = self.err_tx.take() {
            let _ = tx.send(outcome.map_err(|e| e.to_string()));
        }
    }

    /// True when two resource logs target the same resource. Namespaces are identified
    /// by name alone and documents also by their collection.
    pub fn same_target(&self, other: &ChangeLog) -> bool {
        let Some(resource) = self.cmd.resource() else {
            return false;
        };
        if other.cmd.resource() != Some(resource) || self.name != other.name {
            return false;
        }
        match resource {
            Resource::Namespace => true,
            Resource::Document => {
                self.namespace == other.namespace
                    && self.item.get("collection") == other.item.get("collection")
            }
            _ => self.namespace == other.namespace,
        }
    }
}

impl Clone for ChangeLog {
    fn clone(&self) -> Self {
        Self::with_id(
            self.id.clone(),
            self.cmd,
            self.namespace.clone(),
            self.name.clone(),
            self.item.clone(),
        )
        .versioned(self.version)
    }
}

impl ChangeLog {
    fn versioned(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

impl PartialEq for ChangeLog {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.cmd == other.cmd
            && self.name == other.name
            && self.namespace == other.namespace
            && self.item == other.item
            && self.version == other.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_change_log() {
        let cl = ChangeLog::new(
            Command::add(Resource::Service),
            "default",
            "svc1",
            &json!({"name": "svc1", "namespace": "default", "urls": ["http://localhost"]}),
        )
        .unwrap();
        assert_eq!(cl.version, 1);
        assert_eq!(cl.namespace, "default");
        assert!(!cl.id.is_empty());
        assert_eq!(cl.storage_key(), format!("changelog/{}", cl.id));
    }

    #[test]
    fn test_empty_namespace_rejected_for_scoped_resources() {
        let err = ChangeLog::new(Command::add(Resource::Route), "", "r1", &json!({})).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
        assert!(ChangeLog::new(Command::add(Resource::Namespace), "", "ns", &json!({})).is_ok());
    }

    #[test]
    fn test_wire_form() {
        let cl = ChangeLog::with_id(
            "abc",
            Command::delete(Resource::Route),
            "default",
            "r1",
            json!({"name": "r1"}),
        );
        let value: serde_json::Value = serde_json::from_slice(&cl.to_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "abc",
                "cmd": "delete_route",
                "name": "r1",
                "namespace": "default",
                "item": {"name": "r1"},
                "version": 1
            })
        );
        let decoded = ChangeLog::from_bytes(&cl.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, cl);
    }

    #[tokio::test]
    async fn test_error_channel_is_single_use() {
        let mut cl = ChangeLog::noop();
        let rx = cl.error_channel();
        assert!(cl.has_error_channel());
        cl.push_error(Err(&GatewayError::not_found("namespace", "missing")));
        cl.push_error(Ok(()));
        assert!(!cl.has_error_channel());
        assert_eq!(rx.await.unwrap(), Err("namespace not found: missing".to_string()));
    }

    #[test]
    fn test_clone_drops_channel() {
        let mut cl = ChangeLog::noop();
        let _rx = cl.error_channel();
        let copy = cl.clone();
        assert!(!copy.has_error_channel());
        assert_eq!(copy, cl);
    }
}
