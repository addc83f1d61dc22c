//! Persistent partition keyspace backed by redb.
//!
//! Provides the generic byte-range primitives (put/get/delete, range scan,
//! range delete) plus typed operations for the extent deletion table, the
//! deletion cursor and the applied index. Every mutation is one write
//! transaction, so a batch of rows and the bookkeeping that goes with it
//! land together or not at all.

use crate::keys::{
    APPLIED_INDEX_KEY, CURSOR_KEY, DateKey, extent_del_bucket, extent_del_key,
    split_extent_del_key,
};
use crate::tables::{PARTITION_KV, TableTag};
use metanode_common::{DeletionRecord, Error};
use redb::{Database, ReadTransaction, ReadableTable, Table, WriteTransaction};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Error type for partition store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("codec error: {0}")]
    Codec(#[from] Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl StoreError {
    /// Rows that do not decode mean a format mismatch, not a disk problem
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Codec(e) => e.is_fatal(),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

type KvTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;
type Row = (Vec<u8>, Vec<u8>);

/// Rows removed per page while advancing the cursor
pub const EXPIRE_PAGE_SIZE: usize = 1024;

/// Outcome of a cursor advance
#[derive(Debug)]
pub enum CursorAdvance {
    /// Cursor moved forward; `expired` rows were removed
    Advanced { previous: DateKey, expired: u64 },
    /// Proposed cursor was not ahead of the stored one; nothing changed
    Stale { current: DateKey },
}

/// Persistent keyspace of one metadata partition
pub struct PartitionStore {
    db: Database,
    path: PathBuf,
}

impl PartitionStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(PARTITION_KV)?;
        }
        write_txn.commit()?;

        info!("Opened partition store at {:?}", path);
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Database file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ---- Generic byte-range primitives ----

    pub fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PARTITION_KV)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PARTITION_KV)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PARTITION_KV)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Visit rows in `[start, end)` in key order until `visit` returns false
    pub fn range_scan<F>(&self, start: &[u8], end: &[u8], mut visit: F) -> StoreResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> StoreResult<bool>,
    {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PARTITION_KV)?;
        for entry in table.range::<&[u8]>(start..end)? {
            let (key, value) = entry?;
            if !visit(key.value(), value.value())? {
                break;
            }
        }
        Ok(())
    }

    /// Remove every row in `[start, end)`, returning how many were removed
    pub fn range_delete(&self, start: &[u8], end: &[u8]) -> StoreResult<u64> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(PARTITION_KV)?;
            let rows = collect_rows(&table, start, end, usize::MAX)?;
            for (key, _) in &rows {
                table.remove(key.as_slice())?;
            }
            rows.len() as u64
        };
        write_txn.commit()?;
        Ok(removed)
    }

    // ---- Extent deletion table ----

    /// Store `records` under the `date` bucket
    ///
    /// Row keys derive from the extent itself, so writing a record that is
    /// already present overwrites it with identical bytes. When the write
    /// comes from a committed consensus entry, `applied_index` is recorded
    /// in the same transaction.
    pub fn put_extent_deletions(
        &self,
        date: DateKey,
        records: &[DeletionRecord],
        applied_index: Option<u64>,
    ) -> StoreResult<()> {
        if records.is_empty() && applied_index.is_none() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PARTITION_KV)?;
            for record in records {
                let key = extent_del_key(date, &record.extent);
                let value = record.value_bytes();
                table.insert(key.as_slice(), value.as_slice())?;
            }
            if let Some(index) = applied_index {
                bump_applied_index(&mut table, index)?;
            }
        }
        write_txn.commit()?;
        debug!("put {} extent deletions under {}", records.len(), date);
        Ok(())
    }

    /// Move the cursor forward and drop every row older than it
    ///
    /// Rows whose date is strictly less than `cursor` are removed. They are
    /// handed to `expire` one page at a time, oldest first, before the
    /// transaction commits; if `expire` fails nothing is removed and the
    /// cursor stays put. A cursor at or behind the stored one changes
    /// nothing except the applied index.
    pub fn advance_cursor<F>(
        &self,
        cursor: DateKey,
        applied_index: u64,
        mut expire: F,
    ) -> StoreResult<CursorAdvance>
    where
        F: FnMut(&[(DateKey, DeletionRecord)]) -> StoreResult<()>,
    {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(PARTITION_KV)?;
            let current = read_u64(&table, CURSOR_KEY)?.map_or(DateKey::MIN, DateKey::from_raw);

            if cursor <= current {
                bump_applied_index(&mut table, applied_index)?;
                CursorAdvance::Stale { current }
            } else {
                let start = TableTag::ExtentDel.start();
                let end = extent_del_bucket(cursor);
                let mut expired = 0u64;
                loop {
                    let rows = collect_rows(&table, &start, &end, EXPIRE_PAGE_SIZE)?;
                    if rows.is_empty() {
                        break;
                    }
                    let page = rows
                        .iter()
                        .map(|(key, value)| decode_row(key, value))
                        .collect::<StoreResult<Vec<_>>>()?;
                    expire(&page)?;
                    for (key, _) in &rows {
                        table.remove(key.as_slice())?;
                    }
                    expired += rows.len() as u64;
                }
                let raw = cursor.raw().to_be_bytes();
                table.insert(CURSOR_KEY, raw.as_slice())?;
                bump_applied_index(&mut table, applied_index)?;
                CursorAdvance::Advanced {
                    previous: current,
                    expired,
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    /// Current deletion cursor ([`DateKey::MIN`] if never advanced)
    pub fn cursor(&self) -> StoreResult<DateKey> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PARTITION_KV)?;
        Ok(read_u64(&table, CURSOR_KEY)?.map_or(DateKey::MIN, DateKey::from_raw))
    }

    /// Highest consensus index applied to this keyspace
    pub fn applied_index(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PARTITION_KV)?;
        Ok(read_u64(&table, APPLIED_INDEX_KEY)?.unwrap_or(0))
    }

    /// Every pending deletion, oldest bucket first
    pub fn extent_deletions(&self) -> StoreResult<Vec<(DateKey, DeletionRecord)>> {
        let mut result = Vec::new();
        self.range_scan(
            &TableTag::ExtentDel.start(),
            &TableTag::ExtentDel.end(),
            |key, value| {
                result.push(decode_row(key, value)?);
                Ok(true)
            },
        )?;
        Ok(result)
    }

    /// Pending deletions in the `date` bucket, in extent-key order
    pub fn extent_deletions_in(&self, date: DateKey) -> StoreResult<Vec<DeletionRecord>> {
        let mut result = Vec::new();
        self.range_scan(
            &extent_del_bucket(date),
            &date.raw().checked_add(1).map_or_else(
                || TableTag::ExtentDel.end().to_vec(),
                |next| extent_del_bucket(DateKey::from_raw(next)),
            ),
            |key, value| {
                result.push(decode_row(key, value)?.1);
                Ok(true)
            },
        )?;
        Ok(result)
    }

    /// Number of pending deletions
    pub fn count_extent_deletions(&self) -> StoreResult<u64> {
        let mut count = 0u64;
        self.range_scan(
            &TableTag::ExtentDel.start(),
            &TableTag::ExtentDel.end(),
            |_, _| {
                count += 1;
                Ok(true)
            },
        )?;
        Ok(count)
    }

    // ---- Snapshot support ----

    /// Point-in-time view of the whole keyspace
    ///
    /// Writes committed after this call are not visible through the reader.
    pub fn snapshot_reader(&self) -> StoreResult<SnapshotReader> {
        Ok(SnapshotReader {
            txn: self.db.begin_read()?,
        })
    }

    /// Start replacing the whole keyspace
    ///
    /// The existing rows are cleared inside the returned transaction; they
    /// only disappear for good when [`RestoreWriter::commit`] succeeds.
    pub fn begin_restore(&self) -> StoreResult<RestoreWriter> {
        let txn = self.db.begin_write()?;
        txn.delete_table(PARTITION_KV)?;
        {
            let _t = txn.open_table(PARTITION_KV)?;
        }
        Ok(RestoreWriter { txn, rows: 0 })
    }
}

/// Consistent read view used by snapshot producers
pub struct SnapshotReader {
    txn: ReadTransaction,
}

impl SnapshotReader {
    /// Up to `limit` rows strictly after `after` (or from the start)
    pub fn read_page(&self, after: Option<&[u8]>, limit: usize) -> StoreResult<Vec<Row>> {
        let table = self.txn.open_table(PARTITION_KV)?;
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        let mut rows = Vec::with_capacity(limit.min(1024));
        for entry in table.range::<&[u8]>((lower, Bound::Unbounded))? {
            if rows.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            rows.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(rows)
    }
}

/// Write transaction replacing the keyspace with snapshot contents
pub struct RestoreWriter {
    txn: WriteTransaction,
    rows: u64,
}

impl RestoreWriter {
    /// Insert rows verbatim
    pub fn write_rows(&mut self, rows: &[Row]) -> StoreResult<()> {
        let mut table = self.txn.open_table(PARTITION_KV)?;
        for (key, value) in rows {
            table.insert(key.as_slice(), value.as_slice())?;
        }
        self.rows += rows.len() as u64;
        Ok(())
    }

    /// Rows written so far
    pub const fn rows(&self) -> u64 {
        self.rows
    }

    /// Make the restored keyspace visible, returning the row count
    pub fn commit(self) -> StoreResult<u64> {
        self.txn.commit()?;
        Ok(self.rows)
    }

    /// Discard everything written and keep the previous keyspace
    pub fn abort(self) -> StoreResult<()> {
        self.txn.abort()?;
        Ok(())
    }
}

fn collect_rows<T>(table: &T, start: &[u8], end: &[u8], limit: usize) -> StoreResult<Vec<Row>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut rows = Vec::new();
    for entry in table.range::<&[u8]>(start..end)?.take(limit) {
        let (key, value) = entry?;
        rows.push((key.value().to_vec(), value.value().to_vec()));
    }
    Ok(rows)
}

fn read_u64<T>(table: &T, key: &[u8]) -> StoreResult<Option<u64>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let Some(guard) = table.get(key)? else {
        return Ok(None);
    };
    let bytes: [u8; 8] = guard.value().try_into().map_err(|_| {
        Error::protocol(format!(
            "meta row {:?} is not a u64",
            String::from_utf8_lossy(&key[1..])
        ))
    })?;
    Ok(Some(u64::from_be_bytes(bytes)))
}

fn bump_applied_index(table: &mut KvTable<'_>, index: u64) -> StoreResult<()> {
    let current = read_u64(&*table, APPLIED_INDEX_KEY)?.unwrap_or(0);
    if index > current {
        let raw = index.to_be_bytes();
        table.insert(APPLIED_INDEX_KEY, raw.as_slice())?;
    }
    Ok(())
}

fn decode_row(key: &[u8], value: &[u8]) -> StoreResult<(DateKey, DeletionRecord)> {
    let (date, suffix) = split_extent_del_key(key)?;
    Ok((date, DeletionRecord::decode(suffix, value)?))
}
