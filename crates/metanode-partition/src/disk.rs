//! Disk capacity of the filesystem holding a partition

use metanode_common::RotatorConfig;
use std::io;
use std::path::Path;

/// Space on one filesystem, in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskCapacity {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

impl DiskCapacity {
    /// Used share of the filesystem (0-100)
    #[must_use]
    pub const fn usage_percent(&self) -> u64 {
        if self.total == 0 {
            return 0;
        }
        self.used.saturating_mul(100) / self.total
    }
}

/// How much room the backup budget has, by disk usage band
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskStatus {
    /// Below the low-usage threshold
    Plenty,
    /// Between the thresholds
    Normal,
    /// At or above the high-usage threshold
    Tight,
}

impl DiskStatus {
    #[must_use]
    pub fn classify(usage_percent: u64, config: &RotatorConfig) -> Self {
        if usage_percent < u64::from(config.low_usage_percent) {
            Self::Plenty
        } else if usage_percent >= u64::from(config.high_usage_percent) {
            Self::Tight
        } else {
            Self::Normal
        }
    }
}

/// Source of disk capacity figures
///
/// Implementations report byte counts only. Callers derive a [`DiskStatus`]
/// from [`DiskCapacity::usage_percent`] with [`DiskStatus::classify`] and
/// their own thresholds.
pub trait DiskUsage: Send + Sync {
    fn capacity(&self, path: &Path) -> io::Result<DiskCapacity>;
}

/// Reads capacity with `statvfs(3)`
#[derive(Clone, Copy, Debug, Default)]
pub struct StatvfsDiskUsage;

impl DiskUsage for StatvfsDiskUsage {
    #[allow(clippy::unnecessary_cast)]
    fn capacity(&self, path: &Path) -> io::Result<DiskCapacity> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        let frsize = stat.fragment_size() as u64;
        let total = (stat.blocks() as u64).saturating_mul(frsize);
        let available = (stat.blocks_available() as u64).saturating_mul(frsize);
        Ok(DiskCapacity {
            total,
            used: total.saturating_sub(available),
            available,
        })
    }
}
