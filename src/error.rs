//! Error types for the debug probe
//!
//! Provides a unified error type that covers all failure modes across
//! the plugin kernel, bridge transport, rule engines, and inspector.
//! The probe is a guest in the host process: nothing in this module is
//! ever allowed to escalate into a panic on a host-visible path.

use thiserror::Error;

/// Result type alias using ProbeError
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Comprehensive error type for all probe operations
#[derive(Error, Debug)]
pub enum ProbeError {
    /// IO errors (file operations, sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A plugin with this id is already registered
    #[error("Duplicate plugin id: {0}")]
    DuplicatePluginId(String),

    /// No plugin with this id is registered
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// The dependency graph contains a cycle through this plugin
    #[error("Circular dependency involving plugin: {0}")]
    CircularDependency(String),

    /// A plugin declared a dependency that is not registered
    #[error("Plugin '{plugin}' depends on missing plugin '{dependency}'")]
    MissingDependency { plugin: String, dependency: String },

    /// A plugin failed to initialize or start
    #[error("Plugin '{plugin}' failed to start: {cause}")]
    StartFailed { plugin: String, cause: String },

    /// Invalid configuration (bad URL, bad key, registration after start)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Bridge transport errors (connect, handshake, frame encode)
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// The hub rejected the registration handshake
    #[error("Registration rejected: {0}")]
    RegisterRejected(String),

    /// Outbound queue errors
    #[error("Queue error: {0}")]
    Queue(String),

    /// Inspector / embedded database errors
    #[error("Database error: {0}")]
    Database(String),

    /// Access to a resource was denied (sensitive database, bad key)
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// An operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic errors with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ProbeError {
    /// Create an invalid-configuration error with context
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a bridge error with context
    pub fn bridge(msg: impl Into<String>) -> Self {
        Self::Bridge(msg.into())
    }

    /// Create a queue error with context
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a database error with context
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create an access-denied error with context
    pub fn access_denied(msg: impl Into<String>) -> Self {
        Self::AccessDenied(msg.into())
    }

    /// Create a timeout error with context
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a start-failed error for a plugin
    pub fn start_failed(plugin: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::StartFailed {
            plugin: plugin.into(),
            cause: cause.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ProbeError::bridge("socket closed");
        assert_eq!(err.to_string(), "Bridge error: socket closed");

        let err = ProbeError::access_denied("sensitive database");
        assert_eq!(err.to_string(), "Access denied: sensitive database");

        let err = ProbeError::DuplicatePluginId("network".to_string());
        assert_eq!(err.to_string(), "Duplicate plugin id: network");
    }

    #[test]
    fn test_missing_dependency_message() {
        let err = ProbeError::MissingDependency {
            plugin: "breakpoints".to_string(),
            dependency: "network".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Plugin 'breakpoints' depends on missing plugin 'network'"
        );
    }

    #[test]
    fn test_error_conversion_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let probe_err: ProbeError = io_err.into();
        assert!(matches!(probe_err, ProbeError::Io(_)));
    }

    #[test]
    fn test_result_type_usage() {
        fn returns_result() -> Result<String> {
            Ok("success".to_string())
        }

        assert!(returns_result().is_ok());
    }
}
