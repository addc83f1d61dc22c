//! Metanode Partition - replicated extent deletion
//!
//! This crate turns a [`PartitionStore`](metanode_store::PartitionStore)
//! into a replicated state machine:
//! - Ingestion queue that records freed extents and proposes them
//! - Apply path for committed append and cursor commands
//! - Expiry driver that advances the deletion cursor on the leader
//! - Item and batched snapshot producers/consumers
//! - Deletion-key log with disk-aware backup rotation

pub mod command;
pub mod disk;
pub mod error;
pub mod expiry;
pub mod ingest;
pub mod partition;
pub mod replication;
pub mod rotator;
pub mod snapshot;

pub use command::DeletionCommand;
pub use disk::{DiskCapacity, DiskStatus, DiskUsage, StatvfsDiskUsage};
pub use error::{PartitionError, PartitionResult, ReplicationError};
pub use ingest::IngestHandle;
pub use partition::{MetaPartition, NodeContext, STORE_FILE_NAME};
pub use replication::{LocalReplicator, Replicator, StateMachine};
pub use rotator::{BACKUP_PREFIX, BackupRotator, DeletionKeyLog, LIVE_LOG_NAME, RotateReport};
pub use snapshot::{
    BatchIterator, ItemIterator, SnapshotBatch, SnapshotIterator, SnapshotRow, SnapshotVersion,
};
