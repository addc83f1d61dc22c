//! Snapshot producers and consumers
//!
//! A snapshot is the whole partition keyspace (deletion rows, the cursor,
//! the applied index and any other table's rows) streamed as opaque items.
//! Two wire protocols exist:
//!
//! - [`SnapshotVersion::Item`]: one row per item.
//! - [`SnapshotVersion::BatchV1`]: up to `batch_size` rows per item with a
//!   crc32c over the batch.
//!
//! Every item starts with its version byte so a consumer told the wrong
//! version fails on the first item instead of misreading rows.
//!
//! Producers read through one redb read transaction, paging by key, so the
//! snapshot is a point-in-time view that is never fully held in memory.

use crate::error::{PartitionError, PartitionResult};
use metanode_common::{Error, OwnedLimiterPermit};
use metanode_store::{PartitionStore, RestoreWriter, SnapshotReader};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Rows fetched per read in the item protocol
const ITEM_PAGE_ROWS: usize = 1024;

/// Snapshot wire protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SnapshotVersion {
    /// One row per item
    Item = 0,
    /// Checksummed row batches
    BatchV1 = 1,
}

impl SnapshotVersion {
    const fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u32> for SnapshotVersion {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::Item),
            1 => Ok(Self::BatchV1),
            other => Err(Error::UnsupportedSnapshotVersion(other)),
        }
    }
}

/// Forward-only stream of snapshot items
pub trait SnapshotIterator: Send {
    /// Next item, or `None` once exhausted or closed
    fn next(&mut self) -> PartitionResult<Option<Vec<u8>>>;

    /// Release the read view and any held resources
    fn close(&mut self);
}

/// One keyspace row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A run of rows with a checksum over them
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBatch {
    pub rows: Vec<SnapshotRow>,
    pub checksum: u32,
}

impl SnapshotBatch {
    fn new(rows: Vec<SnapshotRow>) -> Self {
        let checksum = batch_checksum(&rows);
        Self { rows, checksum }
    }

    fn verify(&self) -> PartitionResult<()> {
        let actual = batch_checksum(&self.rows);
        if actual != self.checksum {
            return Err(PartitionError::protocol(format!(
                "snapshot batch checksum mismatch: expected {:#010x}, got {actual:#010x}",
                self.checksum
            )));
        }
        Ok(())
    }
}

fn batch_checksum(rows: &[SnapshotRow]) -> u32 {
    rows.iter().fold(0, |crc, row| {
        let crc = crc32c::crc32c_append(crc, &(row.key.len() as u64).to_le_bytes());
        let crc = crc32c::crc32c_append(crc, &row.key);
        let crc = crc32c::crc32c_append(crc, &(row.value.len() as u64).to_le_bytes());
        crc32c::crc32c_append(crc, &row.value)
    })
}

fn encode_item<T: Serialize>(version: SnapshotVersion, payload: &T) -> PartitionResult<Vec<u8>> {
    let body = bincode::serialize(payload)
        .map_err(|e| Error::internal(format!("failed to encode snapshot item: {e}")))?;
    let mut item = Vec::with_capacity(body.len() + 1);
    item.push(version.tag());
    item.extend_from_slice(&body);
    Ok(item)
}

fn decode_item<T: for<'de> Deserialize<'de>>(
    version: SnapshotVersion,
    item: &[u8],
) -> PartitionResult<T> {
    let Some((&tag, body)) = item.split_first() else {
        return Err(PartitionError::protocol("empty snapshot item"));
    };
    if tag != version.tag() {
        return Err(PartitionError::protocol(format!(
            "snapshot item has version {tag}, expected {}",
            version.tag()
        )));
    }
    bincode::deserialize(body)
        .map_err(|e| PartitionError::protocol(format!("malformed snapshot item: {e}")))
}

/// Pages through a read view in key order
struct RowPager {
    reader: SnapshotReader,
    last_key: Option<Vec<u8>>,
    exhausted: bool,
}

impl RowPager {
    const fn new(reader: SnapshotReader) -> Self {
        Self {
            reader,
            last_key: None,
            exhausted: false,
        }
    }

    fn next_page(&mut self, limit: usize) -> PartitionResult<Vec<SnapshotRow>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let rows = self.reader.read_page(self.last_key.as_deref(), limit)?;
        if rows.len() < limit {
            self.exhausted = true;
        }
        if let Some((key, _)) = rows.last() {
            self.last_key = Some(key.clone());
        }
        Ok(rows
            .into_iter()
            .map(|(key, value)| SnapshotRow { key, value })
            .collect())
    }
}

/// Yields one [`SnapshotRow`] per item
pub struct ItemIterator {
    pager: Option<RowPager>,
    buffered: VecDeque<SnapshotRow>,
}

impl ItemIterator {
    #[must_use]
    pub fn new(reader: SnapshotReader) -> Self {
        Self {
            pager: Some(RowPager::new(reader)),
            buffered: VecDeque::new(),
        }
    }
}

impl SnapshotIterator for ItemIterator {
    fn next(&mut self) -> PartitionResult<Option<Vec<u8>>> {
        let Some(pager) = self.pager.as_mut() else {
            return Ok(None);
        };
        if self.buffered.is_empty() {
            self.buffered.extend(pager.next_page(ITEM_PAGE_ROWS)?);
        }
        match self.buffered.pop_front() {
            Some(row) => encode_item(SnapshotVersion::Item, &row).map(Some),
            None => {
                self.close();
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.pager = None;
        self.buffered.clear();
    }
}

/// Yields one [`SnapshotBatch`] per item while holding a limiter slot
pub struct BatchIterator {
    pager: Option<RowPager>,
    batch_size: usize,
    permit: Option<OwnedLimiterPermit>,
}

impl BatchIterator {
    #[must_use]
    pub fn new(reader: SnapshotReader, batch_size: usize, permit: OwnedLimiterPermit) -> Self {
        Self {
            pager: Some(RowPager::new(reader)),
            batch_size: batch_size.max(1),
            permit: Some(permit),
        }
    }
}

impl SnapshotIterator for BatchIterator {
    fn next(&mut self) -> PartitionResult<Option<Vec<u8>>> {
        let Some(pager) = self.pager.as_mut() else {
            return Ok(None);
        };
        let rows = pager.next_page(self.batch_size)?;
        if rows.is_empty() {
            self.close();
            return Ok(None);
        }
        encode_item(SnapshotVersion::BatchV1, &SnapshotBatch::new(rows)).map(Some)
    }

    fn close(&mut self) {
        self.pager = None;
        self.permit = None;
    }
}

/// Replace the keyspace of `store` with the rows streamed by `iter`
///
/// Nothing becomes visible unless every item decodes; on any failure the
/// previous keyspace is kept. Returns the number of rows restored.
pub fn restore(
    store: &PartitionStore,
    iter: &mut dyn SnapshotIterator,
    version: SnapshotVersion,
) -> PartitionResult<u64> {
    let mut writer = store.begin_restore()?;
    let replayed = replay(&mut writer, iter, version);
    iter.close();
    match replayed {
        Ok(()) => {
            let rows = writer.commit()?;
            info!("Restored {} rows from {:?} snapshot", rows, version);
            Ok(rows)
        }
        Err(e) => {
            warn!(
                "Aborting {:?} snapshot restore after {} rows: {}",
                version,
                writer.rows(),
                e
            );
            if let Err(abort_err) = writer.abort() {
                warn!("Failed to abort snapshot restore: {}", abort_err);
            }
            Err(e)
        }
    }
}

fn replay(
    writer: &mut RestoreWriter,
    iter: &mut dyn SnapshotIterator,
    version: SnapshotVersion,
) -> PartitionResult<()> {
    let mut items = 0u64;
    while let Some(item) = iter.next()? {
        let rows = match version {
            SnapshotVersion::Item => {
                let row: SnapshotRow = decode_item(version, &item)?;
                vec![(row.key, row.value)]
            }
            SnapshotVersion::BatchV1 => {
                let batch: SnapshotBatch = decode_item(version, &item)?;
                batch.verify()?;
                batch.rows.into_iter().map(|r| (r.key, r.value)).collect()
            }
        };
        writer.write_rows(&rows)?;
        items += 1;
    }
    debug!("Replayed {} snapshot items", items);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use metanode_common::{ConcurrencyLimiter, DeletionRecord, ExtentKey, SourceType};
    use metanode_store::DateKey;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Iterator over prepared items
    struct VecIterator(VecDeque<Vec<u8>>);

    impl SnapshotIterator for VecIterator {
        fn next(&mut self) -> PartitionResult<Option<Vec<u8>>> {
            Ok(self.0.pop_front())
        }

        fn close(&mut self) {
            self.0.clear();
        }
    }

    fn drain(iter: &mut dyn SnapshotIterator) -> VecIterator {
        let mut items = VecDeque::new();
        while let Some(item) = iter.next().unwrap() {
            items.push_back(item);
        }
        VecIterator(items)
    }

    fn seeded_store(dir: &std::path::Path, rows: u64) -> PartitionStore {
        let store = PartitionStore::open(dir.join("partition.redb")).unwrap();
        let date = DateKey::at(&Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap());
        let records: Vec<_> = (0..rows)
            .map(|i| DeletionRecord {
                extent: ExtentKey {
                    partition_id: i,
                    extent_id: i,
                    ..ExtentKey::default()
                },
                inode: i,
                timestamp: 0,
                source: SourceType::Truncate,
            })
            .collect();
        store.put_extent_deletions(date, &records, Some(9)).unwrap();
        store.put(b"\x20inode/1", b"opaque").unwrap();
        store
    }

    fn keyspace(store: &PartitionStore) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut rows = Vec::new();
        store
            .range_scan(&[0x00], &[0xFF], |k, v| {
                rows.push((k.to_vec(), v.to_vec()));
                Ok(true)
            })
            .unwrap();
        rows
    }

    #[test]
    fn test_version_numbers() {
        assert_eq!(SnapshotVersion::try_from(0).unwrap(), SnapshotVersion::Item);
        assert_eq!(SnapshotVersion::try_from(1).unwrap(), SnapshotVersion::BatchV1);
        assert!(matches!(
            SnapshotVersion::try_from(2),
            Err(Error::UnsupportedSnapshotVersion(2))
        ));
    }

    #[test]
    fn test_item_protocol_restores_every_row() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let src = seeded_store(src_dir.path(), 1500);
        let dst = seeded_store(dst_dir.path(), 3);
        dst.put(b"\x21stale", b"x").unwrap();

        let mut iter = ItemIterator::new(src.snapshot_reader().unwrap());
        let restored = restore(&dst, &mut iter, SnapshotVersion::Item).unwrap();

        // 1500 deletions + opaque row + applied index
        assert_eq!(restored, 1502);
        assert_eq!(keyspace(&dst), keyspace(&src));
        assert_eq!(dst.applied_index().unwrap(), 9);
    }

    #[test]
    fn test_batch_protocol_restores_every_row() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let src = seeded_store(src_dir.path(), 100);
        let dst = PartitionStore::open(dst_dir.path().join("partition.redb")).unwrap();
        let limiter = Arc::new(ConcurrencyLimiter::new(4));

        let mut iter = BatchIterator::new(
            src.snapshot_reader().unwrap(),
            30,
            limiter.acquire_owned().unwrap(),
        );
        let mut items = drain(&mut iter);
        assert_eq!(items.0.len(), 4); // 102 rows in batches of 30
        assert_eq!(limiter.running(), 0);

        restore(&dst, &mut items, SnapshotVersion::BatchV1).unwrap();
        assert_eq!(keyspace(&dst), keyspace(&src));
    }

    #[test]
    fn test_snapshot_ignores_later_writes() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let src = seeded_store(src_dir.path(), 10);
        let dst = PartitionStore::open(dst_dir.path().join("partition.redb")).unwrap();

        let mut iter = ItemIterator::new(src.snapshot_reader().unwrap());
        src.put(b"\x20inode/2", b"late").unwrap();

        restore(&dst, &mut iter, SnapshotVersion::Item).unwrap();
        assert_eq!(dst.get(b"\x20inode/2").unwrap(), None);
        assert_eq!(dst.count_extent_deletions().unwrap(), 10);
    }

    #[test]
    fn test_corrupt_batch_keeps_previous_state() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let src = seeded_store(src_dir.path(), 20);
        let dst = seeded_store(dst_dir.path(), 5);
        let before = keyspace(&dst);
        let limiter = Arc::new(ConcurrencyLimiter::new(4));

        let mut iter = BatchIterator::new(
            src.snapshot_reader().unwrap(),
            8,
            limiter.acquire_owned().unwrap(),
        );
        let mut items = drain(&mut iter);
        let last = items.0.back_mut().unwrap();
        let tail = last.len() - 1;
        last[tail] ^= 0xFF; // flip a checksum byte

        let err = restore(&dst, &mut items, SnapshotVersion::BatchV1).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(keyspace(&dst), before);
    }

    #[test]
    fn test_version_mismatch_keeps_previous_state() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let src = seeded_store(src_dir.path(), 20);
        let dst = seeded_store(dst_dir.path(), 5);
        let before = keyspace(&dst);

        let mut iter = ItemIterator::new(src.snapshot_reader().unwrap());
        let err = restore(&dst, &mut iter, SnapshotVersion::BatchV1).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(keyspace(&dst), before);
    }

    #[test]
    fn test_close_releases_permit() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), 50);
        let limiter = Arc::new(ConcurrencyLimiter::new(4));

        let mut iter = BatchIterator::new(
            store.snapshot_reader().unwrap(),
            10,
            limiter.acquire_owned().unwrap(),
        );
        assert!(iter.next().unwrap().is_some());
        assert_eq!(limiter.running(), 1);

        iter.close();
        assert_eq!(limiter.running(), 0);
        assert!(iter.next().unwrap().is_none());

        let mut items = ItemIterator::new(store.snapshot_reader().unwrap());
        items.close();
        assert!(items.next().unwrap().is_none());
    }

    #[test]
    fn test_empty_snapshot_clears_keyspace() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let src = PartitionStore::open(src_dir.path().join("partition.redb")).unwrap();
        let dst = seeded_store(dst_dir.path(), 5);

        let mut iter = ItemIterator::new(src.snapshot_reader().unwrap());
        assert_eq!(restore(&dst, &mut iter, SnapshotVersion::Item).unwrap(), 0);
        assert!(keyspace(&dst).is_empty());
    }
}
