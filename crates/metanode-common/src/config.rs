//! Configuration types for the metanode
//!
//! Every section implements `Default` and is `#[serde(default)]`, so a
//! configuration file only needs to name the values it changes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a metanode
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity and layout
    pub node: NodeSection,
    /// Extent deletion pipeline
    pub deletion: DeletionConfig,
    /// Deletion-key log rotation
    pub rotator: RotatorConfig,
    /// Background I/O concurrency
    pub limiter: LimiterConfig,
}

impl NodeConfig {
    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id == 0 {
            return Err(Error::configuration("node.node_id must be non-zero"));
        }
        self.deletion.validate()?;
        self.rotator.validate()?;
        self.limiter.validate()
    }
}

/// Node identity and on-disk layout
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Replica ID of this node
    pub node_id: u64,
    /// Root directory; each partition lives in `partition_<id>` below it
    pub data_dir: PathBuf,
    /// Metadata partitions hosted by this node
    pub partitions: Vec<u64>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: 1,
            data_dir: PathBuf::from("/var/lib/metanode"),
            partitions: vec![1],
        }
    }
}

impl NodeSection {
    /// Root directory of one partition
    #[must_use]
    pub fn partition_dir(&self, partition_id: u64) -> PathBuf {
        self.data_dir.join(format!("partition_{partition_id}"))
    }
}

/// Extent deletion pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletionConfig {
    /// Batches buffered before `submit` applies backpressure
    pub queue_capacity: usize,
    /// How long deletion records are kept before expiry
    pub retention_hours: u64,
    /// Expiry driver tick
    pub expiry_interval_secs: u64,
    /// Rows per item in the batched snapshot protocol
    pub snapshot_batch_size: usize,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            retention_hours: 72,
            expiry_interval_secs: 60,
            snapshot_batch_size: 4096,
        }
    }
}

impl DeletionConfig {
    /// Retention window as a duration
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    /// Expiry tick as a duration
    #[must_use]
    pub const fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::configuration("deletion.queue_capacity must be non-zero"));
        }
        if self.snapshot_batch_size == 0 {
            return Err(Error::configuration(
                "deletion.snapshot_batch_size must be non-zero",
            ));
        }
        if self.expiry_interval_secs == 0 {
            return Err(Error::configuration(
                "deletion.expiry_interval_secs must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Deletion-key log rotation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RotatorConfig {
    /// Byte budget for all backups at normal disk usage
    pub max_backup_bytes: u64,
    /// Live log size that triggers rotation
    pub rotate_threshold_bytes: u64,
    /// Below this disk usage the budget is relaxed
    pub low_usage_percent: u8,
    /// At or above this disk usage the budget is cut
    pub high_usage_percent: u8,
    /// Budget multiplier below `low_usage_percent`
    pub relaxed_factor: u64,
    /// Budget divisor at or above `high_usage_percent`
    pub aggressive_divisor: u64,
    /// Rotation check interval
    pub rotate_interval_secs: u64,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            max_backup_bytes: 1024 * 1024 * 1024, // 1 GB
            rotate_threshold_bytes: 64 * 1024 * 1024, // 64 MB
            low_usage_percent: 50,
            high_usage_percent: 80,
            relaxed_factor: 2,
            aggressive_divisor: 4,
            rotate_interval_secs: 600,
        }
    }
}

impl RotatorConfig {
    /// Rotation check interval as a duration
    #[must_use]
    pub const fn rotate_interval(&self) -> Duration {
        Duration::from_secs(self.rotate_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.low_usage_percent >= self.high_usage_percent {
            return Err(Error::configuration(format!(
                "rotator.low_usage_percent ({}) must be below high_usage_percent ({})",
                self.low_usage_percent, self.high_usage_percent
            )));
        }
        if self.high_usage_percent > 100 {
            return Err(Error::configuration(
                "rotator.high_usage_percent must be at most 100",
            ));
        }
        if self.relaxed_factor == 0 || self.aggressive_divisor == 0 {
            return Err(Error::configuration(
                "rotator.relaxed_factor and aggressive_divisor must be non-zero",
            ));
        }
        if self.rotate_interval_secs == 0 {
            return Err(Error::configuration(
                "rotator.rotate_interval_secs must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Background I/O concurrency configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Maximum simultaneous I/O-heavy background jobs per node
    pub max_concurrency: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

impl LimiterConfig {
    fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::configuration("limiter.max_concurrency must be non-zero"));
        }
        Ok(())
    }
}
