//! Deletion-key log and its backup rotation
//!
//! Expired deletion records are appended as text lines to a live log file
//! in the partition directory. The [`BackupRotator`] periodically renames
//! the live log to a timestamped backup, starts a fresh live log, and
//! prunes the oldest backups to stay within a byte budget that shrinks as
//! the disk fills up.

use crate::disk::{DiskStatus, DiskUsage};
use crate::error::PartitionResult;
use chrono::{DateTime, TimeDelta, Utc};
use metanode_common::{ConcurrencyLimiter, DeletionRecord, RotatorConfig};
use metanode_store::DateKey;
use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Name of the live deletion-key log
pub const LIVE_LOG_NAME: &str = "extent_del_keys";
/// Prefix of backups of the live log
pub const BACKUP_PREFIX: &str = "extent_del_keys.";

const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// Append-only text log of expired deletion records
#[derive(Debug)]
pub struct DeletionKeyLog {
    path: PathBuf,
    // Held while appending and while the rotator swaps the file
    lock: Mutex<()>,
}

impl DeletionKeyLog {
    /// Open the live log in `dir`, creating it if missing
    pub fn open(dir: &Path) -> io::Result<Self> {
        let path = dir.join(LIVE_LOG_NAME);
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Live log location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line per expired record
    pub fn append(&self, expired: &[(DateKey, DeletionRecord)]) -> io::Result<()> {
        if expired.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for (date, record) in expired {
            writeln!(writer, "{date} {record}")?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        debug!("Logged {} expired deletions to {:?}", expired.len(), self.path);
        Ok(())
    }

    fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }
}

/// Result of one rotation pass
#[derive(Debug, Default)]
pub struct RotateReport {
    /// Backup created from the live file, if it was rotated
    pub rotated: Option<PathBuf>,
    /// Backups deleted by pruning, oldest first
    pub removed: Vec<PathBuf>,
    /// Backups left after pruning
    pub remaining: usize,
    /// Byte budget the pruning applied
    pub budget: u64,
}

/// Rotates and prunes deletion-key log backups in one directory
pub struct BackupRotator {
    dir: PathBuf,
    config: RotatorConfig,
    disk: Arc<dyn DiskUsage>,
    limiter: Arc<ConcurrencyLimiter>,
    log: Arc<DeletionKeyLog>,
}

impl BackupRotator {
    pub fn new(
        dir: impl Into<PathBuf>,
        config: RotatorConfig,
        disk: Arc<dyn DiskUsage>,
        limiter: Arc<ConcurrencyLimiter>,
        log: Arc<DeletionKeyLog>,
    ) -> Self {
        Self {
            dir: dir.into(),
            config,
            disk,
            limiter,
            log,
        }
    }

    /// Rotate `live_name` if forced or over the size threshold, then prune
    /// `backup_prefix` backups down to the effective budget
    ///
    /// The live file is never pruned and at least one backup is kept.
    pub fn rotate(
        &self,
        live_name: &str,
        backup_prefix: &str,
        force: bool,
    ) -> PartitionResult<RotateReport> {
        let _permit = self.limiter.acquire()?;
        let rotated = self.rotate_live(live_name, backup_prefix, force)?;

        let budget = self.effective_budget();
        let mut backups = self.list_backups(live_name, backup_prefix)?;
        let mut total: u64 = backups.iter().map(|(_, size)| size).sum();
        let mut removed = Vec::new();

        let mut oldest = 0;
        while total > budget && backups.len() - oldest > 1 {
            let (path, size) = &backups[oldest];
            fs::remove_file(path)?;
            info!("Pruned deletion-key backup {:?} ({} bytes)", path, size);
            total -= size;
            removed.push(path.clone());
            oldest += 1;
        }
        backups.drain(..oldest);

        Ok(RotateReport {
            rotated,
            removed,
            remaining: backups.len(),
            budget,
        })
    }

    /// Backup byte budget scaled by current disk usage
    pub fn effective_budget(&self) -> u64 {
        let base = self.config.max_backup_bytes;
        match self.disk.capacity(&self.dir) {
            Ok(capacity) => match DiskStatus::classify(capacity.usage_percent(), &self.config) {
                DiskStatus::Plenty => base.saturating_mul(self.config.relaxed_factor),
                DiskStatus::Normal => base,
                DiskStatus::Tight => base / self.config.aggressive_divisor.max(1),
            },
            Err(e) => {
                warn!("Failed to read disk usage for {:?}, using base budget: {}", self.dir, e);
                base
            }
        }
    }

    fn rotate_live(
        &self,
        live_name: &str,
        backup_prefix: &str,
        force: bool,
    ) -> io::Result<Option<PathBuf>> {
        let live = self.dir.join(live_name);
        let _guard = self.log.exclusive();

        let size = match fs::metadata(&live) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                File::create(&live)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !force && size < self.config.rotate_threshold_bytes {
            return Ok(None);
        }

        let backup = self.backup_path(backup_prefix, Utc::now());
        fs::rename(&live, &backup)?;
        File::create(&live)?;
        info!("Rotated {:?} ({} bytes) to {:?}", live, size, backup);
        Ok(Some(backup))
    }

    fn backup_path(&self, backup_prefix: &str, mut stamp: DateTime<Utc>) -> PathBuf {
        loop {
            let path = self.dir.join(format!(
                "{backup_prefix}{}",
                stamp.format(BACKUP_TIMESTAMP_FORMAT)
            ));
            if !path.exists() {
                return path;
            }
            stamp += TimeDelta::milliseconds(1);
        }
    }

    fn list_backups(&self, live_name: &str, backup_prefix: &str) -> io::Result<Vec<(PathBuf, u64)>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name == live_name || !name.starts_with(backup_prefix) {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_file() {
                backups.push((entry.path(), meta.len()));
            }
        }
        backups.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(backups)
    }
}

/// Check the live log every `interval` until shutdown
pub(crate) async fn rotate_loop(
    rotator: Weak<BackupRotator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let Some(rotator) = rotator.upgrade() else {
            break;
        };
        let result = tokio::task::spawn_blocking(move || {
            rotator.rotate(LIVE_LOG_NAME, BACKUP_PREFIX, false)
        })
        .await;
        match result {
            Ok(Ok(report)) => {
                if report.rotated.is_some() || !report.removed.is_empty() {
                    debug!(
                        "Rotation pass: rotated={:?} pruned={} remaining={}",
                        report.rotated,
                        report.removed.len(),
                        report.remaining
                    );
                }
            }
            Ok(Err(e)) => warn!("Deletion-key log rotation failed: {}", e),
            Err(e) => error!("Deletion-key log rotation task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::testing::{FailingDiskUsage, FixedDiskUsage};
    use metanode_common::{ExtentKey, SourceType};
    use tempfile::tempdir;

    const MB: u64 = 1024 * 1024;

    fn config() -> RotatorConfig {
        RotatorConfig {
            max_backup_bytes: 20 * MB,
            rotate_threshold_bytes: 4 * MB,
            ..RotatorConfig::default()
        }
    }

    fn rotator(dir: &Path, disk: Arc<dyn DiskUsage>) -> BackupRotator {
        let log = Arc::new(DeletionKeyLog::open(dir).unwrap());
        BackupRotator::new(
            dir,
            config(),
            disk,
            Arc::new(ConcurrencyLimiter::new(4)),
            log,
        )
    }

    fn make_backups(dir: &Path, count: usize) {
        for i in 0..count {
            let name = format!("{BACKUP_PREFIX}20261017090000{i:03}");
            let file = File::create(dir.join(name)).unwrap();
            file.set_len(6 * MB).unwrap();
        }
    }

    fn backup_count(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                let name = e.as_ref().unwrap().file_name();
                name.to_string_lossy().starts_with(BACKUP_PREFIX)
            })
            .count()
    }

    #[test]
    fn test_normal_usage_keeps_backups_within_budget() {
        let dir = tempdir().unwrap();
        make_backups(dir.path(), 2);
        let rotator = rotator(dir.path(), Arc::new(FixedDiskUsage(60)));

        let report = rotator.rotate(LIVE_LOG_NAME, BACKUP_PREFIX, false).unwrap();
        assert!(report.rotated.is_none());
        assert_eq!(report.budget, 20 * MB);
        assert_eq!(backup_count(dir.path()), 2);
        assert!(dir.path().join(LIVE_LOG_NAME).exists());
    }

    #[test]
    fn test_low_usage_relaxes_budget() {
        let dir = tempdir().unwrap();
        make_backups(dir.path(), 5);
        let rotator = rotator(dir.path(), Arc::new(FixedDiskUsage(40)));

        let report = rotator.rotate(LIVE_LOG_NAME, BACKUP_PREFIX, false).unwrap();
        assert_eq!(report.budget, 40 * MB);
        assert_eq!(report.remaining, 5);
        assert_eq!(backup_count(dir.path()), 5);
    }

    #[test]
    fn test_normal_usage_prunes_oldest() {
        let dir = tempdir().unwrap();
        make_backups(dir.path(), 5);
        let rotator = rotator(dir.path(), Arc::new(FixedDiskUsage(60)));

        let report = rotator.rotate(LIVE_LOG_NAME, BACKUP_PREFIX, false).unwrap();
        assert_eq!(report.remaining, 3);
        assert_eq!(report.removed.len(), 2);
        assert!(report.removed[0].ends_with(format!("{BACKUP_PREFIX}20261017090000000")));
        assert!(report.removed[1].ends_with(format!("{BACKUP_PREFIX}20261017090000001")));
        assert_eq!(backup_count(dir.path()), 3);
    }

    #[test]
    fn test_high_usage_keeps_newest_backup() {
        let dir = tempdir().unwrap();
        make_backups(dir.path(), 5);
        let rotator = rotator(dir.path(), Arc::new(FixedDiskUsage(90)));

        let report = rotator.rotate(LIVE_LOG_NAME, BACKUP_PREFIX, false).unwrap();
        assert_eq!(report.budget, 5 * MB);
        assert_eq!(report.remaining, 1);
        assert!(dir.path().join(format!("{BACKUP_PREFIX}20261017090000004")).exists());
        assert!(dir.path().join(LIVE_LOG_NAME).exists());
    }

    #[test]
    fn test_disk_failure_falls_back_to_base_budget() {
        let dir = tempdir().unwrap();
        make_backups(dir.path(), 5);
        let rotator = rotator(dir.path(), Arc::new(FailingDiskUsage));

        let report = rotator.rotate(LIVE_LOG_NAME, BACKUP_PREFIX, false).unwrap();
        assert_eq!(report.budget, 20 * MB);
        assert_eq!(report.remaining, 3);
    }

    #[test]
    fn test_forced_rotation_creates_backup_and_fresh_live_file() {
        let dir = tempdir().unwrap();
        let rotator = rotator(dir.path(), Arc::new(FixedDiskUsage(60)));
        let live = dir.path().join(LIVE_LOG_NAME);
        fs::write(&live, b"pending line\n").unwrap();

        let unforced = rotator.rotate(LIVE_LOG_NAME, BACKUP_PREFIX, false).unwrap();
        assert!(unforced.rotated.is_none());

        let first = rotator.rotate(LIVE_LOG_NAME, BACKUP_PREFIX, true).unwrap();
        let second = rotator.rotate(LIVE_LOG_NAME, BACKUP_PREFIX, true).unwrap();
        let first = first.rotated.unwrap();
        let second = second.rotated.unwrap();

        assert_ne!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"pending line\n");
        assert_eq!(fs::metadata(&live).unwrap().len(), 0);
        assert_eq!(backup_count(dir.path()), 2);
    }

    #[test]
    fn test_oversized_live_file_rotates_unforced() {
        let dir = tempdir().unwrap();
        let rotator = rotator(dir.path(), Arc::new(FixedDiskUsage(60)));
        let live = dir.path().join(LIVE_LOG_NAME);
        File::create(&live).unwrap().set_len(5 * MB).unwrap();

        let report = rotator.rotate(LIVE_LOG_NAME, BACKUP_PREFIX, false).unwrap();
        assert!(report.rotated.is_some());
        assert_eq!(fs::metadata(&live).unwrap().len(), 0);
    }

    #[test]
    fn test_log_appends_one_line_per_record() {
        let dir = tempdir().unwrap();
        let log = DeletionKeyLog::open(dir.path()).unwrap();
        let record = DeletionRecord {
            extent: ExtentKey {
                partition_id: 4,
                extent_id: 8,
                ..ExtentKey::default()
            },
            inode: 15,
            timestamp: 1,
            source: SourceType::DeleteInode,
        };
        let date = DateKey::from_raw(0x07EA_0A11_0900);

        log.append(&[(date, record), (date, record)]).unwrap();
        log.append(&[]).unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("2026-10-17T09 dp=4 extent=8"));
    }
}
