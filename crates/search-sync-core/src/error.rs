//! Error types for the search index synchronizer
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.

use std::fmt;
use thiserror::Error;

/// Result type alias for synchronizer operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// How an upstream failure should be treated by the bootstrap fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// The upstream answered 404: the resource is not provisioned yet
    NotReady,
    /// Network errors, timeouts, 408/429 and 5xx responses
    Transient,
    /// Any other non-success status (malformed request, auth, ...)
    Permanent,
}

impl UpstreamFailure {
    /// Classify an HTTP status code returned by the upstream service
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotReady,
            408 | 429 | 500..=599 => Self::Transient,
            _ => Self::Permanent,
        }
    }

    /// Label used for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary error type for all synchronizer operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Upstream (source-of-truth) service errors
    #[error("Upstream error ({kind}): {message}")]
    Upstream {
        kind: UpstreamFailure,
        message: String,
        status: Option<u16>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Index store read or write errors
    #[error("Index error: {message}")]
    Index {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// NATS connection or messaging errors
    #[error("NATS error: {message}")]
    Nats {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Message serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Notification handler failed to apply a change
    #[error("Handler error: {message}")]
    Handler { message: String },

    /// Retry limit exceeded
    #[error("Retry exhausted after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },

    /// Operation abandoned because shutdown was requested
    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create an upstream error without an HTTP status (transport level)
    pub fn upstream(kind: UpstreamFailure, message: impl Into<String>) -> Self {
        Self::Upstream {
            kind,
            message: message.into(),
            status: None,
            source: None,
        }
    }

    /// Create an upstream error from a non-success HTTP status
    pub fn upstream_status(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            kind: UpstreamFailure::from_status(status),
            message: message.into(),
            status: Some(status),
            source: None,
        }
    }

    /// Create a transient upstream error with source
    pub fn upstream_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Upstream {
            kind: UpstreamFailure::Transient,
            message: message.into(),
            status: None,
            source: Some(Box::new(source)),
        }
    }

    /// Create an index error
    pub fn index(message: impl Into<String>) -> Self {
        Self::Index {
            message: message.into(),
            source: None,
        }
    }

    /// Create an index error with source
    pub fn index_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Index {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a NATS error
    pub fn nats(message: impl Into<String>) -> Self {
        Self::Nats {
            message: message.into(),
            source: None,
        }
    }

    /// Create a NATS error with source
    pub fn nats_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Nats {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a serialization error with source
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a handler error
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Upstream failure class, if this is an upstream error
    pub fn upstream_failure(&self) -> Option<UpstreamFailure> {
        match self {
            Self::Upstream { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Check if error was caused by a shutdown request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization("JSON encoding failed", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(UpstreamFailure::from_status(404), UpstreamFailure::NotReady);
        assert_eq!(UpstreamFailure::from_status(503), UpstreamFailure::Transient);
        assert_eq!(UpstreamFailure::from_status(429), UpstreamFailure::Transient);
        assert_eq!(UpstreamFailure::from_status(408), UpstreamFailure::Transient);
        assert_eq!(UpstreamFailure::from_status(400), UpstreamFailure::Permanent);
        assert_eq!(UpstreamFailure::from_status(401), UpstreamFailure::Permanent);
    }

    #[test]
    fn test_upstream_failure_and_cancellation() {
        assert_eq!(
            SyncError::upstream_status(404, "missing").upstream_failure(),
            Some(UpstreamFailure::NotReady)
        );
        assert_eq!(
            SyncError::upstream_status(400, "bad request").upstream_failure(),
            Some(UpstreamFailure::Permanent)
        );
        assert_eq!(SyncError::index("write failed").upstream_failure(), None);
        assert!(SyncError::cancelled("fetch").is_cancelled());
        assert!(!SyncError::config("bad").is_cancelled());
    }
}
