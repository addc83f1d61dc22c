//! Commands replicated through the consensus log
//!
//! The payload handed to [`Replicator::propose`](crate::Replicator::propose)
//! is a bincode-encoded [`DeletionCommand`]. Every replica decodes the same
//! bytes in commit order, so decoding must either succeed identically
//! everywhere or fail the apply.

use metanode_common::{DeletionRecord, Error, Result};
use metanode_store::DateKey;
use serde::{Deserialize, Serialize};

/// State change for the extent deletion table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionCommand {
    /// Store `records` under `date`; the date is fixed by the proposer
    AppendBatch {
        date: DateKey,
        records: Vec<DeletionRecord>,
    },
    /// Raise the deletion cursor and expire everything below it
    AdvanceCursor { cursor: DateKey },
}

impl DeletionCommand {
    /// Serialize for proposal
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| Error::internal(format!("failed to encode {} command: {e}", self.name())))
    }

    /// Parse a committed entry
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| {
            Error::protocol(format!(
                "malformed deletion command ({} bytes): {e}",
                data.len()
            ))
        })
    }

    /// Short name for logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AppendBatch { .. } => "append_batch",
            Self::AdvanceCursor { .. } => "advance_cursor",
        }
    }
}
