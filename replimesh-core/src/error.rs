//! Structured error types for replimesh.
//!
//! Uses `thiserror` so library consumers get composable errors.
//! The CLI wraps these in `anyhow` for convenience.

use thiserror::Error;

use crate::instance::InstanceId;
use crate::operation::OperationKind;
use crate::role::Role;

/// Main error type for routing, execution and transactions
#[derive(Error, Debug)]
pub enum MeshError {
    /// No instance is configured for the requested role (or at all)
    #[error("No instance available{}", role_suffix(.role))]
    NoInstanceAvailable { role: Option<Role> },

    /// Writes must always name their authoritative instance
    #[error("An explicit instance is required for write operations")]
    InstanceRequiredForWrite,

    /// Instance has no connection URL in configuration
    #[error("No connection URL configured for instance {instance}")]
    NoConnectionUrl { instance: InstanceId },

    /// Operation kind is not dispatched by the executor
    #[error("Unsupported operation: {kind}")]
    UnsupportedOperation { kind: OperationKind },

    /// Operation descriptor is malformed or used through the wrong entry point
    #[error("Invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// Role code or name could not be parsed
    #[error("Unknown role '{value}'")]
    UnknownRole { value: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Transaction session already ended
    #[error("Transaction session is no longer active")]
    SessionClosed,

    /// Database driver failure, propagated unchanged
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Errors raised at the database driver boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },

    #[error("Operation timed out")]
    Timeout,

    /// Transaction lost an optimistic concurrency check at commit
    #[error("Write conflict: transaction aborted")]
    WriteConflict,

    #[error("Query failed: {reason}")]
    Query { reason: String },

    #[error("Client is closed")]
    Closed,
}

fn role_suffix(role: &Option<Role>) -> String {
    match role {
        Some(role) => format!(" for role {}", role),
        None => String::new(),
    }
}

/// Result type alias for replimesh operations
pub type Result<T> = std::result::Result<T, MeshError>;

impl MeshError {
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Errors a caller may reasonably retry (network, timeouts, commit conflicts).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeshError::Driver(
                DriverError::Connection { .. } | DriverError::Timeout | DriverError::WriteConflict
            )
        )
    }

    /// Errors caused by process configuration rather than the request.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MeshError::NoConnectionUrl { .. }
                | MeshError::Config { .. }
                | MeshError::NoInstanceAvailable { .. }
        )
    }
}

impl DriverError {
    pub fn query(reason: impl Into<String>) -> Self {
        Self::Query {
            reason: reason.into(),
        }
    }

    pub fn connection(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connection {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeshError::NoInstanceAvailable {
            role: Some(Role::Guardian),
        };
        assert_eq!(err.to_string(), "No instance available for role R");

        let err = MeshError::NoInstanceAvailable { role: None };
        assert_eq!(err.to_string(), "No instance available");

        let err = MeshError::NoConnectionUrl {
            instance: InstanceId::new("ins3"),
        };
        assert!(err.to_string().contains("ins3"));
    }

    #[test]
    fn test_driver_error_conversion() {
        let err: MeshError = DriverError::Timeout.into();
        assert!(matches!(err, MeshError::Driver(DriverError::Timeout)));
        assert!(err.is_transient());
        assert!(!MeshError::InstanceRequiredForWrite.is_transient());
    }

    #[test]
    fn test_configuration_classification() {
        assert!(MeshError::config("bad").is_configuration());
        assert!(!MeshError::Driver(DriverError::Closed).is_configuration());
    }
}
