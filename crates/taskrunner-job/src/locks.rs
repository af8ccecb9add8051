//! Per-record serialization
//!
//! Launch, stop and every reconciliation entry take the lock for the record
//! name they are about to mutate, so at most one of them touches a record at
//! a time. Locks for different names never contend. The reconciler only ever
//! uses [`RecordLocks::try_acquire`]: a launch holds its lock for the whole
//! start polling window.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry handing out one async mutex per record name
#[derive(Clone, Default)]
pub struct RecordLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl RecordLocks {
    /// Wait for exclusive access to `name`
    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the map shard is not held across the await
        let lock = self.inner.entry(name.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Take `name` only if nobody holds it right now
    pub fn try_acquire(&self, name: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = self.inner.entry(name.to_string()).or_default().clone();
        lock.try_lock_owned().ok()
    }

    /// Drop entries nobody holds or waits on
    pub fn prune_idle(&self) {
        self.inner.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Number of tracked names
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no names are tracked
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
