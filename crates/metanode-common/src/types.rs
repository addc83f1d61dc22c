//! Core types for extent deletion
//!
//! An [`ExtentKey`] names a physical extent on a data node. A
//! [`DeletionRecord`] is an extent key that a metadata operation stopped
//! referencing, together with the inode and cause that released it.
//!
//! Both types carry a fixed-width big-endian binary form used by the
//! partition keyspace: the extent key becomes the suffix of the row key
//! (so re-inserting the same extent overwrites the same row) and the rest
//! of the record becomes the row value.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a physical data extent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExtentKey {
    /// Data partition holding the extent
    pub partition_id: u64,
    /// Extent ID within the data partition
    pub extent_id: u64,
    /// Offset inside the extent
    pub extent_offset: u64,
    /// Logical offset inside the file
    pub file_offset: u64,
    /// Length in bytes
    pub size: u32,
    /// CRC of the extent data
    pub crc: u32,
}

impl ExtentKey {
    /// Encoded size of the key suffix
    pub const ENCODED_LEN: usize = 40;

    /// Encode as a row key suffix
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.partition_id.to_be_bytes());
        buf[8..16].copy_from_slice(&self.extent_id.to_be_bytes());
        buf[16..24].copy_from_slice(&self.extent_offset.to_be_bytes());
        buf[24..32].copy_from_slice(&self.file_offset.to_be_bytes());
        buf[32..36].copy_from_slice(&self.size.to_be_bytes());
        buf[36..40].copy_from_slice(&self.crc.to_be_bytes());
        buf
    }

    /// Decode from a row key suffix
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != Self::ENCODED_LEN {
            return Err(Error::protocol(format!(
                "extent key suffix is {} bytes, expected {}",
                data.len(),
                Self::ENCODED_LEN
            )));
        }
        Ok(Self {
            partition_id: be_u64(&data[0..8]),
            extent_id: be_u64(&data[8..16]),
            extent_offset: be_u64(&data[16..24]),
            file_offset: be_u64(&data[24..32]),
            size: be_u32(&data[32..36]),
            crc: be_u32(&data[36..40]),
        })
    }
}

/// Why an extent stopped being referenced
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SourceType {
    /// File was truncated below the extent
    #[default]
    Truncate = 0,
    /// Last link to the file was removed
    Unlink = 1,
    /// Inode was evicted
    DeleteInode = 2,
}

impl SourceType {
    /// All known source types, in tag order
    pub const ALL: [Self; 3] = [Self::Truncate, Self::Unlink, Self::DeleteInode];
}

impl TryFrom<u64> for SourceType {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(Self::Truncate),
            1 => Ok(Self::Unlink),
            2 => Ok(Self::DeleteInode),
            other => Err(Error::UnknownSourceType(other)),
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Truncate => "truncate",
            Self::Unlink => "unlink",
            Self::DeleteInode => "delete_inode",
        };
        f.write_str(name)
    }
}

/// An extent pending physical reclamation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeletionRecord {
    /// Extent that is no longer referenced
    pub extent: ExtentKey,
    /// Inode that owned the extent
    pub inode: u64,
    /// Creation time (unix seconds)
    pub timestamp: i64,
    /// Cause of the deletion
    pub source: SourceType,
}

impl DeletionRecord {
    /// Encoded size of the row value
    pub const VALUE_LEN: usize = 24;

    /// Encode the non-key fields as a row value
    #[must_use]
    pub fn value_bytes(&self) -> [u8; Self::VALUE_LEN] {
        let mut buf = [0u8; Self::VALUE_LEN];
        buf[0..8].copy_from_slice(&self.inode.to_be_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[16..24].copy_from_slice(&(self.source as u64).to_be_bytes());
        buf
    }

    /// Rebuild a record from its key suffix and row value
    pub fn decode(suffix: &[u8], value: &[u8]) -> Result<Self> {
        let extent = ExtentKey::from_bytes(suffix)?;
        if value.len() != Self::VALUE_LEN {
            return Err(Error::protocol(format!(
                "deletion record value is {} bytes, expected {}",
                value.len(),
                Self::VALUE_LEN
            )));
        }
        Ok(Self {
            extent,
            inode: be_u64(&value[0..8]),
            timestamp: i64::from_be_bytes(fixed(&value[8..16])),
            source: SourceType::try_from(be_u64(&value[16..24]))?,
        })
    }
}

impl fmt::Display for DeletionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ek = &self.extent;
        write!(
            f,
            "dp={} extent={} extent_offset={} file_offset={} size={} crc={} inode={} ts={} src={}",
            ek.partition_id,
            ek.extent_id,
            ek.extent_offset,
            ek.file_offset,
            ek.size,
            ek.crc,
            self.inode,
            self.timestamp,
            self.source
        )
    }
}

fn fixed<const N: usize>(data: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(data);
    buf
}

fn be_u64(data: &[u8]) -> u64 {
    u64::from_be_bytes(fixed(data))
}

fn be_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes(fixed(data))
}
