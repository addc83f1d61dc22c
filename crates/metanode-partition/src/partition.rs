//! One metadata partition's extent deletion state
//!
//! [`MetaPartition`] owns the partition keyspace, the deletion-key log and
//! the background tasks that feed and trim them. It is also the
//! [`StateMachine`] the replication layer drives: committed commands and
//! snapshots reach the keyspace only through it.

use crate::command::DeletionCommand;
use crate::disk::DiskUsage;
use crate::error::{PartitionError, PartitionResult, ReplicationError};
use crate::expiry::{expiry_cursor, expiry_loop};
use crate::ingest::{IngestHandle, IngestMessage, IngestWorker};
use crate::replication::{Replicator, StateMachine};
use crate::rotator::{
    BACKUP_PREFIX, BackupRotator, DeletionKeyLog, LIVE_LOG_NAME, RotateReport, rotate_loop,
};
use crate::snapshot::{self, BatchIterator, ItemIterator, SnapshotIterator, SnapshotVersion};
use chrono::Utc;
use metanode_common::{ConcurrencyLimiter, DeletionConfig, DeletionRecord, Error, NodeConfig};
use metanode_store::{CursorAdvance, DateKey, PartitionStore};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// redb file inside a partition directory
pub const STORE_FILE_NAME: &str = "partition.redb";

/// Node-wide resources shared by every partition on a node
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: u64,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub disk: Arc<dyn DiskUsage>,
}

/// Extent deletion state of one metadata partition replica
pub struct MetaPartition {
    partition_id: u64,
    node_id: u64,
    root: PathBuf,
    deletion: DeletionConfig,
    rotate_interval: Duration,
    store: Arc<PartitionStore>,
    replicator: Arc<dyn Replicator>,
    limiter: Arc<ConcurrencyLimiter>,
    del_log: Arc<DeletionKeyLog>,
    rotator: Arc<BackupRotator>,
    // Cached copy of the persisted cursor
    cursor: AtomicU64,
    // Set when a committed entry fails to apply; cleared by a snapshot
    offline: Arc<AtomicBool>,
    ingest: IngestHandle,
    ingest_rx: Mutex<Option<mpsc::Receiver<IngestMessage>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MetaPartition {
    /// Open the partition stored under `root`
    ///
    /// Background tasks do not run until [`start`](Self::start).
    pub fn open(
        partition_id: u64,
        root: impl Into<PathBuf>,
        config: &NodeConfig,
        ctx: &NodeContext,
        replicator: Arc<dyn Replicator>,
    ) -> PartitionResult<Arc<Self>> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let store = Arc::new(PartitionStore::open(root.join(STORE_FILE_NAME))?);
        let cursor = store.cursor()?;
        let del_log = Arc::new(DeletionKeyLog::open(&root)?);
        let rotator = Arc::new(BackupRotator::new(
            &root,
            config.rotator.clone(),
            Arc::clone(&ctx.disk),
            Arc::clone(&ctx.limiter),
            Arc::clone(&del_log),
        ));
        let (ingest, ingest_rx) = IngestHandle::channel(config.deletion.queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            "Opened partition {} at {:?} (cursor {}, applied index {})",
            partition_id,
            root,
            cursor,
            store.applied_index()?
        );

        Ok(Arc::new(Self {
            partition_id,
            node_id: ctx.node_id,
            root,
            deletion: config.deletion.clone(),
            rotate_interval: config.rotator.rotate_interval(),
            store,
            replicator,
            limiter: Arc::clone(&ctx.limiter),
            del_log,
            rotator,
            cursor: AtomicU64::new(cursor.raw()),
            offline: Arc::new(AtomicBool::new(false)),
            ingest,
            ingest_rx: Mutex::new(Some(ingest_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the ingestion worker, expiry driver and rotation task
    pub fn start(self: &Arc<Self>) -> PartitionResult<()> {
        let Some(rx) = self.ingest_rx.lock().take() else {
            return Err(Error::internal(format!(
                "partition {} already started",
                self.partition_id
            ))
            .into());
        };

        let worker = IngestWorker {
            partition_id: self.partition_id,
            node_id: self.node_id,
            store: Arc::clone(&self.store),
            replicator: Arc::clone(&self.replicator),
            limiter: Arc::clone(&self.limiter),
            offline: Arc::clone(&self.offline),
        };

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(worker.run(rx, self.shutdown_tx.subscribe())));
        tasks.push(tokio::spawn(expiry_loop(
            Arc::downgrade(self),
            self.deletion.expiry_interval(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(rotate_loop(
            Arc::downgrade(&self.rotator),
            self.rotate_interval,
            self.shutdown_tx.subscribe(),
        )));

        info!("Started partition {} on node {}", self.partition_id, self.node_id);
        Ok(())
    }

    /// Stop background tasks and refuse further submissions
    ///
    /// Batches already queued are processed before the ingestion worker
    /// exits.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        // Never started: dropping the receiver closes the queue
        drop(self.ingest_rx.lock().take());

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Partition {} task ended abnormally: {}", self.partition_id, e);
            }
        }
        info!("Partition {} shut down", self.partition_id);
    }

    /// Handle for registering with a replication layer
    #[must_use]
    pub fn as_state_machine(self: &Arc<Self>) -> Arc<dyn StateMachine> {
        Arc::clone(self) as Arc<dyn StateMachine>
    }

    pub const fn partition_id(&self) -> u64 {
        self.partition_id
    }

    pub const fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Partition directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Partition keyspace
    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    /// Live deletion-key log
    pub fn deletion_log(&self) -> &DeletionKeyLog {
        &self.del_log
    }

    /// Current deletion cursor
    pub fn cursor(&self) -> DateKey {
        DateKey::from_raw(self.cursor.load(Ordering::SeqCst))
    }

    /// Whether a failed apply has taken this replica offline
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> PartitionResult<()> {
        if self.is_offline() {
            return Err(PartitionError::Offline(self.partition_id));
        }
        Ok(())
    }

    /// Whether this replica currently leads its group
    pub fn is_leader(&self) -> bool {
        self.replicator.leader_id() == Some(self.node_id)
    }

    // ---- Ingestion ----

    /// Cloneable submission handle
    pub fn ingest_handle(&self) -> IngestHandle {
        self.ingest.clone()
    }

    /// Queue freed extents for recording, waiting while the queue is full
    pub async fn submit(&self, records: Vec<DeletionRecord>) -> PartitionResult<()> {
        self.ensure_online()?;
        self.ingest.submit(records).await
    }

    /// [`submit`](Self::submit) for callers outside the async runtime
    pub fn blocking_submit(&self, records: Vec<DeletionRecord>) -> PartitionResult<()> {
        self.ensure_online()?;
        self.ingest.blocking_submit(records)
    }

    /// Wait until every batch queued so far has been stored and proposed
    pub async fn flush(&self) -> PartitionResult<()> {
        self.ingest.flush().await
    }

    // ---- Expiry ----

    /// Propose moving the cursor to `cursor`, returning the commit index
    pub async fn advance_cursor(&self, cursor: DateKey) -> PartitionResult<u64> {
        self.ensure_online()?;
        if !self.is_leader() {
            return Err(ReplicationError::NotLeader {
                leader: self.replicator.leader_id(),
            }
            .into());
        }
        let command = DeletionCommand::AdvanceCursor { cursor }.encode()?;
        Ok(self.replicator.propose(command).await?)
    }

    /// One expiry tick: on the leader, propose the retention cursor if it
    /// is ahead of the current one
    pub async fn expire_once(&self) -> PartitionResult<Option<u64>> {
        if !self.is_leader() {
            return Ok(None);
        }
        let candidate = expiry_cursor(Utc::now(), self.deletion.retention());
        if candidate <= self.cursor() {
            return Ok(None);
        }
        self.advance_cursor(candidate).await.map(Some)
    }

    // ---- Rotation ----

    /// Rotate the deletion-key log now; blocks on file I/O
    pub fn rotate_log(&self, force: bool) -> PartitionResult<RotateReport> {
        self.rotator.rotate(LIVE_LOG_NAME, BACKUP_PREFIX, force)
    }

    fn apply_command(&self, command: DeletionCommand, index: u64) -> PartitionResult<()> {
        match command {
            DeletionCommand::AppendBatch { date, records } => {
                self.store
                    .put_extent_deletions(date, &records, Some(index))?;
                debug!(
                    "Partition {} applied {} deletions under {} at index {}",
                    self.partition_id,
                    records.len(),
                    date,
                    index
                );
            }
            DeletionCommand::AdvanceCursor { cursor } => {
                // Expired rows reach the log before their removal commits
                let outcome = self
                    .store
                    .advance_cursor(cursor, index, |page| Ok(self.del_log.append(page)?))?;
                match outcome {
                    CursorAdvance::Advanced { previous, expired } => {
                        self.cursor.store(cursor.raw(), Ordering::SeqCst);
                        info!(
                            "Partition {} moved deletion cursor {} -> {}, expired {} records",
                            self.partition_id, previous, cursor, expired
                        );
                    }
                    CursorAdvance::Stale { current } => {
                        debug!(
                            "Partition {} ignored cursor {} at index {} (current {})",
                            self.partition_id, cursor, index, current
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

impl StateMachine for MetaPartition {
    /// A failed entry takes the replica offline: every later entry is
    /// refused until a snapshot replaces the keyspace or the partition is
    /// reopened.
    fn apply(&self, command: &[u8], index: u64) -> PartitionResult<()> {
        if self.is_offline() {
            error!(
                "Partition {} is offline, refusing entry {}",
                self.partition_id, index
            );
            return Err(PartitionError::Offline(self.partition_id));
        }
        let result = DeletionCommand::decode(command)
            .map_err(PartitionError::from)
            .and_then(|command| self.apply_command(command, index));
        if let Err(e) = &result {
            self.offline.store(true, Ordering::SeqCst);
            error!(
                "Partition {} failed to apply entry {}, going offline: {}",
                self.partition_id, index, e
            );
        }
        result
    }

    /// A batch snapshot waits for a limiter permit, so call this from a
    /// blocking context when the limiter may be saturated.
    fn produce_snapshot(
        &self,
        version: SnapshotVersion,
    ) -> PartitionResult<Box<dyn SnapshotIterator>> {
        info!(
            "Partition {} producing {:?} snapshot",
            self.partition_id, version
        );
        Ok(match version {
            SnapshotVersion::Item => Box::new(ItemIterator::new(self.store.snapshot_reader()?)),
            SnapshotVersion::BatchV1 => {
                let permit = self.limiter.acquire_owned()?;
                Box::new(BatchIterator::new(
                    self.store.snapshot_reader()?,
                    self.deletion.snapshot_batch_size,
                    permit,
                ))
            }
        })
    }

    fn consume_snapshot(
        &self,
        iter: &mut dyn SnapshotIterator,
        version: SnapshotVersion,
    ) -> PartitionResult<u64> {
        let rows = snapshot::restore(&self.store, iter, version)?;
        let cursor = self.store.cursor()?;
        self.cursor.store(cursor.raw(), Ordering::SeqCst);
        if self.offline.swap(false, Ordering::SeqCst) {
            info!("Partition {} back online after snapshot", self.partition_id);
        }
        info!(
            "Partition {} installed snapshot: {} rows, cursor {}",
            self.partition_id, rows, cursor
        );
        Ok(rows)
    }
}
