//! Ingestion of freed extents
//!
//! Callers hand batches of [`DeletionRecord`]s to an [`IngestHandle`]. A
//! single worker per partition drains the bounded queue in order: each
//! batch is written locally under the current hour, and on the leader it
//! is then proposed so every replica stores it under the same hour.

use crate::command::DeletionCommand;
use crate::error::PartitionResult;
use crate::replication::Replicator;
use metanode_common::{ConcurrencyLimiter, DeletionRecord, Error};
use metanode_store::{DateKey, PartitionStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

pub(crate) enum IngestMessage {
    Batch(Vec<DeletionRecord>),
    Flush(oneshot::Sender<()>),
}

/// Submission side of a partition's ingestion queue
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestMessage>,
}

impl IngestHandle {
    /// Create a handle and the receiver its worker drains
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<IngestMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a batch, waiting while the queue is full
    pub async fn submit(&self, records: Vec<DeletionRecord>) -> PartitionResult<()> {
        self.tx
            .send(IngestMessage::Batch(records))
            .await
            .map_err(|_| Error::Shutdown)?;
        Ok(())
    }

    /// Queue a batch from outside the async runtime
    ///
    /// Must not be called from an async context.
    pub fn blocking_submit(&self, records: Vec<DeletionRecord>) -> PartitionResult<()> {
        self.tx
            .blocking_send(IngestMessage::Batch(records))
            .map_err(|_| Error::Shutdown)?;
        Ok(())
    }

    /// Wait until every batch queued before this call has been processed
    pub async fn flush(&self) -> PartitionResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(IngestMessage::Flush(done_tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        done_rx.await.map_err(|_| Error::Shutdown)?;
        Ok(())
    }
}

/// Drains one partition's ingestion queue
pub(crate) struct IngestWorker {
    pub partition_id: u64,
    pub node_id: u64,
    pub store: Arc<PartitionStore>,
    pub replicator: Arc<dyn Replicator>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub offline: Arc<AtomicBool>,
}

impl IngestWorker {
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<IngestMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Ingestion worker started for partition {}", self.partition_id);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        // Refuse new batches and release blocked submitters, then finish
        // what was already accepted.
        rx.close();
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
        }
        info!("Ingestion worker stopped for partition {}", self.partition_id);
    }

    async fn handle(&self, msg: IngestMessage) {
        match msg {
            IngestMessage::Batch(records) => self.ingest(records).await,
            IngestMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn ingest(&self, records: Vec<DeletionRecord>) {
        if records.is_empty() {
            debug!("Skipping empty deletion batch for partition {}", self.partition_id);
            return;
        }
        if self.offline.load(Ordering::SeqCst) {
            error!(
                "Dropping {} deletions for offline partition {}",
                records.len(),
                self.partition_id
            );
            return;
        }

        let date = DateKey::now();
        let store = Arc::clone(&self.store);
        let limiter = Arc::clone(&self.limiter);
        let written = tokio::task::spawn_blocking(move || -> PartitionResult<Vec<DeletionRecord>> {
            let _permit = limiter.acquire()?;
            store.put_extent_deletions(date, &records, None)?;
            Ok(records)
        })
        .await;

        let records = match written {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                error!(
                    "Failed to store deletion batch for partition {}: {}",
                    self.partition_id, e
                );
                return;
            }
            Err(e) => {
                error!(
                    "Deletion batch task failed for partition {}: {}",
                    self.partition_id, e
                );
                return;
            }
        };
        debug!(
            "Stored {} deletions under {} for partition {}",
            records.len(),
            date,
            self.partition_id
        );

        if self.replicator.leader_id() != Some(self.node_id) {
            return;
        }

        let count = records.len();
        let command = match (DeletionCommand::AppendBatch { date, records }).encode() {
            Ok(command) => command,
            Err(e) => {
                error!("Failed to encode deletion batch: {}", e);
                return;
            }
        };
        match self.replicator.propose(command).await {
            Ok(index) => debug!(
                "Replicated {} deletions for partition {} at index {}",
                count, self.partition_id, index
            ),
            Err(e) => warn!(
                "Failed to replicate {} deletions for partition {}: {}",
                count, self.partition_id, e
            ),
        }
    }
}
