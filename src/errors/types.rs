//! # Error Types
//!
//! Error types for the flowgate control plane using `thiserror`.

/// Custom result type for flowgate operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the flowgate control plane
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// Configuration errors (invalid builder inputs, unknown storage kind, ...)
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Write-side submission on a node that does not hold leadership
    #[error("this node is not the leader")]
    NotLeader,

    /// Quorum did not acknowledge the operation in time
    #[error("apply timed out after {duration_ms}ms")]
    ApplyTimeout { duration_ms: u64 },

    /// Errors raised by the consensus layer
    #[error("Consensus error: {0}")]
    Consensus(String),

    /// The state manager rejected a change log
    #[error("State error: {message}")]
    State { message: String },

    /// Typed per-resource not-found errors
    #[error("{resource} not found: {name}")]
    NotFound { resource: String, name: String },

    /// Operation conflicts with existing state (e.g. deleting a namespace still in use)
    #[error("{message}")]
    Conflict { message: String, resource: String },

    /// Storage backend failures
    #[error("Storage error: {context}")]
    Storage {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transient storage unavailability
    #[error("store is locked")]
    StoreLocked,

    /// Key lookup miss in the storage layer
    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// Upstream or peer transport failures
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn consensus<S: Into<String>>(message: S) -> Self {
        Self::Consensus(message.into())
    }

    pub fn state<S: Into<String>>(message: S) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create a typed not-found error, e.g. `not_found("namespace", "default")`
    pub fn not_found<R: ToString, N: Into<String>>(resource: R, name: N) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict<M: Into<String>, R: ToString>(message: M, resource: R) -> Self {
        Self::Conflict {
            message: message.into(),
            resource: resource.to_string(),
        }
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(context: S) -> Self {
        Self::Storage {
            context: context.into(),
            source: None,
        }
    }

    /// Create a storage error with source
    pub fn storage_with_source<S: Into<String>>(
        context: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Storage {
            context: context.into(),
            source: Some(source),
        }
    }

    pub fn key_not_found<S: Into<String>>(key: S) -> Self {
        Self::KeyNotFound { key: key.into() }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap a serde_json error with context
    pub fn serialization<S: Into<String>>(context: S, source: serde_json::Error) -> Self {
        Self::Serialization {
            source,
            context: context.into(),
        }
    }

    /// Get the HTTP status code that should be returned for this error
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Config { .. } => 500,
            GatewayError::Validation { .. } => 400,
            GatewayError::NotLeader => 421,
            GatewayError::ApplyTimeout { .. } => 504,
            GatewayError::Consensus(_) => 503,
            GatewayError::State { .. } => 422,
            GatewayError::NotFound { .. } => 404,
            GatewayError::KeyNotFound { .. } => 404,
            GatewayError::Conflict { .. } => 409,
            GatewayError::Storage { .. } => 500,
            GatewayError::StoreLocked => 503,
            GatewayError::Serialization { .. } => 400,
            GatewayError::Io { .. } => 500,
            GatewayError::Transport { .. } => 502,
            GatewayError::Internal { .. } => 500,
        }
    }

    /// Check if this error should be retried by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::ApplyTimeout { .. }
                | GatewayError::Consensus(_)
                | GatewayError::StoreLocked
                | GatewayError::Transport { .. }
        )
    }

    /// True for missing keys and missing resources
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. } | GatewayError::KeyNotFound { .. })
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(error: sqlx::Error) -> Self {
        Self::storage_with_source("Database operation failed", Box::new(error))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            source: error,
            context: "I/O operation failed".to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            source: error,
            context: "JSON serialization failed".to_string(),
        }
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        let message = fields
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::validation(format!("Validation failed: {}", message))
    }
}
