//! Partition error types

use metanode_common::Error;
use metanode_store::StoreError;
use thiserror::Error;

/// Failure to get a command committed by the replica group
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// This replica cannot propose
    #[error("Not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    /// Commit did not happen in time
    #[error("Proposal timed out")]
    Timeout,

    /// Replica group refused the entry
    #[error("Proposal rejected: {0}")]
    Rejected(String),
}

impl ReplicationError {
    /// Every replication failure may succeed on a later attempt
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        true
    }
}

/// Partition error
#[derive(Error, Debug)]
pub enum PartitionError {
    /// Codec, lifecycle and configuration errors
    #[error(transparent)]
    Common(#[from] Error),

    /// Keyspace error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Replication error
    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking task panicked or was cancelled
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A committed entry failed to apply; later entries are refused
    #[error("Partition {0} is offline after a failed apply")]
    Offline(u64),
}

impl PartitionError {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Common(Error::protocol(msg))
    }

    /// Malformed commands or snapshot items; the operation must not be skipped
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Common(e) => e.is_fatal(),
            Self::Store(e) => e.is_fatal(),
            Self::Offline(_) => true,
            _ => false,
        }
    }
}

/// Result type for partition operations
pub type PartitionResult<T> = Result<T, PartitionError>;
