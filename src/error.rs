//! Error types for the Tether engine
//!
//! Errors are structured with fields to aid debugging in production.
//! Store-facing variants carry the identity of the object involved so a
//! failure reported to the error sink can be traced back to a resource.

use thiserror::Error;

use crate::object::ObjectKey;

/// Main error type for Tether operations
#[derive(Debug, Error)]
pub enum Error {
    /// Network, timeout or server-side failure talking to the store
    #[error("transient store error [{operation}]: {message}")]
    Transient {
        /// Store operation that failed (list, get, update, watch, ...)
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// The caller's version token was stale
    #[error("conflict updating {key}: {message}")]
    Conflict {
        /// Identity of the object being written
        key: ObjectKey,
        /// Description reported by the store
        message: String,
    },

    /// The object does not exist (anymore)
    #[error("{key} not found")]
    NotFound {
        /// Identity that was looked up
        key: ObjectKey,
    },

    /// Create was called for an identity that already exists
    #[error("{key} already exists")]
    AlreadyExists {
        /// Identity that already exists
        key: ObjectKey,
    },

    /// A watch was resumed from a version the store no longer retains
    #[error("resource version {version} is too old to resume from")]
    Expired {
        /// The rejected resume point
        version: String,
    },

    /// User reconcile, finalize or deleted logic failed
    #[error("callback failed: {message}")]
    Callback {
        /// Description of what failed
        message: String,
    },

    /// Invalid engine setup (e.g. malformed finalizer registration)
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's invalid
        message: String,
        /// The offending field or identifier, if known
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a transient store error for the given operation
    pub fn transient(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error for the given object
    pub fn conflict(key: ObjectKey, msg: impl Into<String>) -> Self {
        Self::Conflict {
            key,
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given object
    pub fn not_found(key: ObjectKey) -> Self {
        Self::NotFound { key }
    }

    /// Create a callback failure with the given message
    ///
    /// User reconcile/finalize logic returns this to signal that the object
    /// should be presented again on the next event.
    pub fn callback(msg: impl Into<String>) -> Self {
        Self::Callback {
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field or identifier
    pub fn configuration_for(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration and serialization errors require a code or setup fix.
    /// Store errors are retried by the watcher or facade; callback failures
    /// are retried when the object is presented again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient { .. } => true,
            Error::Conflict { .. } => true,
            Error::NotFound { .. } => false,
            Error::AlreadyExists { .. } => false,
            Error::Expired { .. } => true,
            Error::Callback { .. } => true,
            Error::Configuration { .. } => false,
            Error::Serialization { .. } => false,
        }
    }

    /// Returns true if the object vanished between read and act
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Returns true if a write lost an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Get the object identity if this error is about a specific object
    pub fn key(&self) -> Option<&ObjectKey> {
        match self {
            Error::Conflict { key, .. } => Some(key),
            Error::NotFound { key } => Some(key),
            Error::AlreadyExists { key } => Some(key),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
