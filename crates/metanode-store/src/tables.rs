//! Redb table definitions for the partition keyspace.
//!
//! A partition keeps all of its rows in one sorted byte table. The first
//! byte of every key is a [`TableTag`] naming the logical table the row
//! belongs to, so each logical table is a contiguous key range.

use redb::TableDefinition;

// Key: [tag][table-specific key], Value: table-specific encoding
pub const PARTITION_KV: TableDefinition<&[u8], &[u8]> = TableDefinition::new("partition_kv");

/// Logical table prefix byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TableTag {
    /// Pending extent deletions: `[tag][date][extent key]`
    ExtentDel = 0x0A,
    /// Partition bookkeeping (cursor, applied index): `[tag][name]`
    Meta = 0xF0,
}

impl TableTag {
    /// Prefix byte for this table
    #[must_use]
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// First key of this table
    #[must_use]
    pub const fn start(self) -> [u8; 1] {
        [self as u8]
    }

    /// First key past the end of this table
    #[must_use]
    pub const fn end(self) -> [u8; 1] {
        [self as u8 + 1]
    }
}
