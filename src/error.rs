//! Error types for the tether engine.

use crate::RecordId;
use thiserror::Error;

/// All possible errors from the tether engine.
///
/// Transport errors carry a `retryable` flag: retryable failures (network
/// loss, timeouts, server 5xx) keep the operation queued for backoff retry,
/// while non-retryable failures and conflicts drop the operation and let the
/// next reconciliation pass re-establish truth.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Network, timeout, or server failure on a remote call.
    #[error("transport error: {message}")]
    Transport {
        /// Human-readable failure description.
        message: String,
        /// Whether the operation should stay queued and be retried.
        retryable: bool,
    },

    /// The server rejected an operation as semantically invalid,
    /// e.g. updating a record that was deleted remotely.
    #[error("operation on record '{id}' rejected: {reason}")]
    Conflict {
        /// The record the rejected operation targeted.
        id: RecordId,
        /// Server-supplied rejection reason.
        reason: String,
    },

    /// Durable snapshot save or load failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A snapshot could not be decoded or has an unsupported format.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// The engine has been shut down.
    #[error("engine is shut down")]
    Closed,
}

impl Error {
    /// Create a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a conflict error for a record.
    pub fn conflict(id: impl Into<RecordId>, reason: impl Into<String>) -> Self {
        Error::Conflict {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failed operation should stay queued and be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { retryable: true, .. })
    }

    /// Whether this is a server-side semantic rejection.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
