//! Replication seam
//!
//! The consensus transport lives outside this crate. A partition only
//! needs to propose commands ([`Replicator`]) and to be driven by committed
//! entries and snapshots ([`StateMachine`]). [`LocalReplicator`] is an
//! in-process log that commits every proposal immediately and fans it out
//! to the registered state machines in index order. A member that fails
//! an entry is dropped from the group and receives nothing after it.

use crate::error::{PartitionResult, ReplicationError};
use crate::snapshot::{SnapshotIterator, SnapshotVersion};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Proposes commands to the replica group
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Submit `command` and wait until it is committed, returning its index
    async fn propose(&self, command: Vec<u8>) -> Result<u64, ReplicationError>;

    /// Current leader, if one is known
    fn leader_id(&self) -> Option<u64>;
}

/// Callbacks invoked by the replication layer
pub trait StateMachine: Send + Sync {
    /// Apply one committed entry; calls arrive in commit order
    fn apply(&self, command: &[u8], index: u64) -> PartitionResult<()>;

    /// Start streaming a point-in-time snapshot
    fn produce_snapshot(&self, version: SnapshotVersion)
    -> PartitionResult<Box<dyn SnapshotIterator>>;

    /// Replace local state with a snapshot, returning the rows restored
    fn consume_snapshot(
        &self,
        iter: &mut dyn SnapshotIterator,
        version: SnapshotVersion,
    ) -> PartitionResult<u64>;
}

/// Single-process replica group
///
/// Proposals are accepted from any caller; leadership is whatever
/// [`set_leader`](Self::set_leader) last assigned.
pub struct LocalReplicator {
    // Last committed index; held while fanning out so applies are serialized
    log: tokio::sync::Mutex<u64>,
    members: Mutex<Vec<Member>>,
    next_member: AtomicU64,
    leader: RwLock<Option<u64>>,
    fail_proposals: AtomicBool,
}

struct Member {
    id: u64,
    machine: Weak<dyn StateMachine>,
}

impl LocalReplicator {
    #[must_use]
    pub fn new(leader: Option<u64>) -> Self {
        Self {
            log: tokio::sync::Mutex::new(0),
            members: Mutex::new(Vec::new()),
            next_member: AtomicU64::new(1),
            leader: RwLock::new(leader),
            fail_proposals: AtomicBool::new(false),
        }
    }

    /// Add a replica that receives every later commit
    pub fn register(&self, member: &Arc<dyn StateMachine>) {
        let id = self.next_member.fetch_add(1, Ordering::Relaxed);
        self.members.lock().push(Member {
            id,
            machine: Arc::downgrade(member),
        });
    }

    pub fn set_leader(&self, leader: Option<u64>) {
        *self.leader.write() = leader;
    }

    /// Make every proposal fail until cleared
    pub fn set_fail_proposals(&self, fail: bool) {
        self.fail_proposals.store(fail, Ordering::SeqCst);
    }

    /// Index of the last committed entry
    pub async fn last_index(&self) -> u64 {
        *self.log.lock().await
    }

    /// Number of replicas still receiving commits
    pub fn member_count(&self) -> usize {
        self.live_members().len()
    }

    fn live_members(&self) -> Vec<(u64, Arc<dyn StateMachine>)> {
        let mut members = self.members.lock();
        members.retain(|m| m.machine.strong_count() > 0);
        members
            .iter()
            .filter_map(|m| m.machine.upgrade().map(|machine| (m.id, machine)))
            .collect()
    }
}

#[async_trait]
impl Replicator for LocalReplicator {
    async fn propose(&self, command: Vec<u8>) -> Result<u64, ReplicationError> {
        if self.fail_proposals.load(Ordering::SeqCst) {
            return Err(ReplicationError::Rejected("proposals disabled".to_string()));
        }

        let mut last = self.log.lock().await;
        let index = *last + 1;
        let members = self.live_members();
        let fanout = members.len();

        let results = tokio::task::spawn_blocking(move || {
            members
                .iter()
                .map(|(id, member)| (*id, member.apply(&command, index)))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| ReplicationError::Rejected(format!("apply task failed: {e}")))?;

        // Committed even if a replica failed to apply it
        *last = index;

        let mut failed = Vec::new();
        let mut failure = None;
        for (id, result) in results {
            if let Err(e) = result {
                error!(
                    "Member {} failed to apply entry {}, removing it from the group: {}",
                    id, index, e
                );
                failed.push(id);
                failure.get_or_insert(e.to_string());
            }
        }
        if let Some(msg) = failure {
            self.members.lock().retain(|m| !failed.contains(&m.id));
            return Err(ReplicationError::Rejected(msg));
        }

        debug!("Committed entry {} to {} replicas", index, fanout);
        Ok(index)
    }

    fn leader_id(&self) -> Option<u64> {
        *self.leader.read()
    }
}
