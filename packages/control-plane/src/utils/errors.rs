// packages/control-plane/src/utils/errors.rs
//! Error types for the control plane
//!
//! Expected outcomes such as "agent not found" or "no capacity" are surfaced
//! as `Option`/`bool` results by the registry, discovery and allocator. The
//! variants here cover the cases that callers must treat as failures.

use thiserror::Error;

/// Control plane error
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Unknown agent, allocation or reservation id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed request (unsupported strategy, negative quota, ...)
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Tenant or agent capacity insufficient
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Call rejected because the breaker guarding it is open
    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// Dependency or task exceeded its time budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Task deadline passed before execution started
    #[error("Task expired: {0}")]
    Expired(String),

    /// Task handler returned an error
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Connection to '{dependency}' failed: {reason}")]
    ConnectionFailed { dependency: String, reason: String },

    /// Mandatory dependency unreachable during start
    #[error("Startup failed: {0}")]
    StartupFailed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ControlPlaneError {
    /// Whether a retry with backoff may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlPlaneError::Timeout(_)
                | ControlPlaneError::CircuitOpen(_)
                | ControlPlaneError::ConnectionFailed { .. }
                | ControlPlaneError::HandlerFailed(_)
                | ControlPlaneError::Messaging(_)
        )
    }

    /// Short label used for metrics and task replies
    pub fn kind(&self) -> &'static str {
        match self {
            ControlPlaneError::NotFound(_) => "not_found",
            ControlPlaneError::ValidationFailed(_) => "validation_failed",
            ControlPlaneError::QuotaExceeded(_) => "quota_exceeded",
            ControlPlaneError::CircuitOpen(_) => "circuit_open",
            ControlPlaneError::Timeout(_) => "timeout",
            ControlPlaneError::Expired(_) => "expired",
            ControlPlaneError::HandlerFailed(_) => "handler_failed",
            ControlPlaneError::ConnectionFailed { .. } => "connection_failed",
            ControlPlaneError::StartupFailed(_) => "startup_failed",
            ControlPlaneError::InvalidState(_) => "invalid_state",
            ControlPlaneError::Messaging(_) => "messaging",
            ControlPlaneError::StorageFailed(_) => "storage_failed",
            ControlPlaneError::ConfigError(_) => "config_error",
            ControlPlaneError::Serialization(_) => "serialization",
        }
    }
}

impl From<config::ConfigError> for ControlPlaneError {
    fn from(err: config::ConfigError) -> Self {
        ControlPlaneError::ConfigError(err.to_string())
    }
}

impl From<rusqlite::Error> for ControlPlaneError {
    fn from(err: rusqlite::Error) -> Self {
        ControlPlaneError::StorageFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ControlPlaneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ControlPlaneError::CircuitOpen("database".to_string());
        assert_eq!(err.to_string(), "Circuit breaker 'database' is open");

        let err = ControlPlaneError::ConnectionFailed {
            dependency: "bus".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(err.to_string(), "Connection to 'bus' failed: refused");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ControlPlaneError::Timeout("t".into()).is_retryable());
        assert!(ControlPlaneError::HandlerFailed("h".into()).is_retryable());
        assert!(!ControlPlaneError::Expired("e".into()).is_retryable());
        assert!(!ControlPlaneError::ValidationFailed("v".into()).is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ControlPlaneError::QuotaExceeded("q".into()).kind(), "quota_exceeded");
        assert_eq!(ControlPlaneError::Timeout("t".into()).kind(), "timeout");
    }
}
