//! Error types for the metanode
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for metanode operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for metanode
#[derive(Debug, Error)]
pub enum Error {
    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown deletion source type: {0}")]
    UnknownSourceType(u64),

    #[error("unsupported snapshot version: {0}")]
    UnsupportedSnapshotVersion(u32),

    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("shut down")]
    Shutdown,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Malformed payloads mean the replicas disagree on the wire format.
    /// Continuing would let them diverge, so the operation must abort.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::UnknownSourceType(_) | Self::UnsupportedSnapshotVersion(_)
        )
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
