//! Metanode Store - persistent partition keyspace
//!
//! This crate implements the sorted, byte-keyed table every metadata
//! partition keeps in redb, and the extent-deletion rows stored in it.

pub mod keys;
pub mod store;
pub mod tables;

// Re-exports
pub use keys::DateKey;
pub use store::{
    CursorAdvance, PartitionStore, RestoreWriter, SnapshotReader, StoreError, StoreResult,
};
pub use tables::TableTag;
