// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mutation relay.
//!
//! Errors are split by how the relay reacts to them, not just by where they
//! come from. Structural failures (a payload that will never decode, a key
//! nobody registered) are absorbed and dead-lettered. Transient failures are
//! left pending on the broker so the reclaim sweep can try again.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Broker` | Yes | Network errors, timeouts, connection failures |
//! | `Apply` | Yes | Target store rejected a replayed mutation |
//! | `Store` | No | Local SQLite errors (needs operator attention) |
//! | `Serialization` | No | Payload cannot be encoded or decoded |
//! | `UnknownKey` | No | Envelope names a type nobody registered |
//! | `Sharding` | No | Shard resolver could not place the row |
//! | `Config` | No | Configuration invalid |
//! | `Io` | No | Local file errors (abandoned sink) |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Relay is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! `Apply` is retryable in the sense that the broker entry stays pending: the
//! reclaim sweep re-delivers it until it succeeds or ages out.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while publishing, consuming or replaying mutations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Redis connection or command error.
    #[error("Broker error ({operation}): {message}")]
    Broker {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// JSON marshal/unmarshal failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No entity type is registered under this key.
    #[error("Unknown registry key: {0}")]
    UnknownKey(String),

    /// Target store refused a replayed mutation.
    ///
    /// Returned from the replayer so the broker entry stays pending.
    #[error("Apply error ({key}): {message}")]
    Apply { key: String, message: String },

    /// Shard resolver failed for a row.
    #[error("Sharding error ({key}): {message}")]
    Sharding { key: String, message: String },

    /// SQLite error in the relational store.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local file error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a broker error from a redis::RedisError
    pub fn broker(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a broker error without source
    pub fn broker_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn apply(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Apply {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn sharding(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sharding {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker { .. } => true,
            Self::Apply { .. } => true, // stays pending, reclaim retries
            Self::Serialization(_) => false,
            Self::UnknownKey(_) => false,
            Self::Sharding { .. } => false,
            Self::Store(_) => false,
            Self::Config(_) => false,
            Self::Io(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        Self::broker("unknown", e)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_broker() {
        let err = RelayError::broker_msg("XREADGROUP", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("XREADGROUP"));
    }

    #[test]
    fn test_is_retryable_apply() {
        let err = RelayError::apply("model.User", "database is locked");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("model.User"));
    }

    #[test]
    fn test_not_retryable_structural() {
        assert!(!RelayError::Serialization("eof".into()).is_retryable());
        assert!(!RelayError::UnknownKey("model.Ghost".into()).is_retryable());
        assert!(!RelayError::sharding("model.User", "no shard").is_retryable());
    }

    #[test]
    fn test_not_retryable_config() {
        let err = RelayError::Config("invalid redis URL".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = RelayError::InvalidState {
            expected: "Running".to_string(),
            actual: "Stopped".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Running"));
        assert!(err.to_string().contains("Stopped"));
    }

    #[test]
    fn test_not_retryable_shutdown() {
        assert!(!RelayError::Shutdown.is_retryable());
    }

    #[test]
    fn test_from_serde_json() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: RelayError = parse.unwrap_err().into();
        assert!(matches!(err, RelayError::Serialization(_)));
    }

    #[test]
    fn test_broker_error_formatting() {
        let err = RelayError::Broker {
            operation: "XRANGE".to_string(),
            message: "timeout".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Broker error"));
        assert!(msg.contains("XRANGE"));
        assert!(msg.contains("timeout"));
    }
}
