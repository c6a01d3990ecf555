//! Error taxonomy shared by all store backends.
//!
//! Four kinds, each carrying a message and an optional cause. Callers
//! retry `OptimisticLock` after reloading state; the remaining kinds
//! propagate or escalate.

use crate::types::BoxError;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Another writer advanced the aggregate first, or the target row
    /// already exists. Retryable after reloading the aggregate.
    #[error("optimistic lock conflict: {message}")]
    OptimisticLock {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A domain object could not be encoded.
    #[error("serialization failed: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A stored payload could not be decoded or converted back into a
    /// domain object.
    #[error("deserialization failed: {message}")]
    Deserialization {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Backend transport failure or a non-conditional transaction
    /// failure.
    #[error("I/O failure: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl EventStoreError {
    pub fn optimistic_lock(message: impl Into<String>) -> Self {
        Self::OptimisticLock {
            message: message.into(),
            source: None,
        }
    }

    pub fn optimistic_lock_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::OptimisticLock {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    pub fn serialization_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
            source: None,
        }
    }

    pub fn deserialization_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Deserialization {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
        }
    }

    pub fn io_with(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}
