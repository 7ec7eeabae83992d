//! Change-log commands: the `(action, resource)` discriminator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Add,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Action::Add),
            "delete" => Ok(Action::Delete),
            other => Err(GatewayError::validation_field(format!("unknown action: {}", other), "cmd")),
        }
    }
}

/// Resource kinds managed by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Namespace,
    Service,
    Route,
    Module,
    Domain,
    Secret,
    Collection,
    Document,
}

impl Resource {
    pub const ALL: [Resource; 8] = [
        Resource::Namespace,
        Resource::Service,
        Resource::Route,
        Resource::Module,
        Resource::Domain,
        Resource::Secret,
        Resource::Collection,
        Resource::Document,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Namespace => "namespace",
            Resource::Service => "service",
            Resource::Route => "route",
            Resource::Module => "module",
            Resource::Domain => "domain",
            Resource::Secret => "secret",
            Resource::Collection => "collection",
            Resource::Document => "document",
        }
    }

    /// Whether a change to `self` can affect state derived from `other`.
    ///
    /// Identical kinds and namespaces relate to everything; otherwise only the
    /// route/service, route/module, module/namespace and collection/document pairs do.
    pub fn is_related_to(&self, other: Resource) -> bool {
        use Resource::*;
        if *self == other || *self == Namespace || other == Namespace {
            return true;
        }
        matches!(
            (*self, other),
            (Route, Service)
                | (Service, Route)
                | (Route, Module)
                | (Module, Route)
                | (Collection, Document)
                | (Document, Collection)
        )
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| GatewayError::validation_field(format!("unknown resource: {}", s), "cmd"))
    }
}

/// A change-log command. On the wire this is `<action>_<resource>` or one of
/// `noop`, `shutdown`, `restart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Command {
    Apply { action: Action, resource: Resource },
    Noop,
    Shutdown,
    Restart,
}

impl Command {
    pub const fn add(resource: Resource) -> Self {
        Command::Apply {
            action: Action::Add,
            resource,
        }
    }

    pub const fn delete(resource: Resource) -> Self {
        Command::Apply {
            action: Action::Delete,
            resource,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Command::Noop)
    }

    pub fn action(&self) -> Option<Action> {
        match self {
            Command::Apply { action, .. } => Some(*action),
            _ => None,
        }
    }

    pub fn resource(&self) -> Option<Resource> {
        match self {
            Command::Apply { resource, .. } => Some(*resource),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Apply { action, resource } => write!(f, "{}_{}", action, resource),
            Command::Noop => f.write_str("noop"),
            Command::Shutdown => f.write_str("shutdown"),
            Command::Restart => f.write_str("restart"),
        }
    }
}

impl FromStr for Command {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noop" => Ok(Command::Noop),
            "shutdown" => Ok(Command::Shutdown),
            "restart" => Ok(Command::Restart),
            _ => {
                let (action, resource) = s.split_once('_').ok_or_else(|| {
                    GatewayError::validation_field(format!("invalid command: {}", s), "cmd")
                })?;
                Ok(Command::Apply {
                    action: action.parse()?,
                    resource: resource.parse()?,
                })
            }
        }
    }
}

impl TryFrom<String> for Command {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Command> for String {
    fn from(cmd: Command) -> Self {
        cmd.to_string()
    }
}
