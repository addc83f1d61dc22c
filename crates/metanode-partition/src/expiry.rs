//! Periodic cursor advancement

use crate::partition::MetaPartition;
use chrono::{DateTime, TimeDelta, Utc};
use metanode_store::DateKey;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Cursor that expires everything older than `retention` before `now`
#[must_use]
pub fn expiry_cursor(now: DateTime<Utc>, retention: Duration) -> DateKey {
    TimeDelta::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .map_or(DateKey::MIN, |cutoff| DateKey::at(&cutoff))
}

/// Propose cursor advances every `interval` until shutdown
///
/// Only the leader proposes; a failed tick is retried on the next one.
pub(crate) async fn expiry_loop(
    partition: Weak<MetaPartition>,
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

        let Some(partition) = partition.upgrade() else {
            break;
        };
        match partition.expire_once().await {
            Ok(Some(index)) => info!(
                "Partition {} advanced deletion cursor at index {}",
                partition.partition_id(),
                index
            ),
            Ok(None) => {}
            Err(e) => warn!(
                "Partition {} failed to advance deletion cursor: {}",
                partition.partition_id(),
                e
            ),
        }
    }
}
