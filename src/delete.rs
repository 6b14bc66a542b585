//! # Deferred Deletion
//!
//! Records are rarely destroyed at the moment they become garbage - the
//! caller schedules them and the pending set is drained synchronously while
//! the write lock is being released. The manager itself is just the pending
//! set with idempotent scheduling; the actual destruct-and-free orchestration
//! lives on `Database`, which owns the registry and the store.
//!
//! Scheduling the same address twice is tolerated (and logged): different
//! owners may independently discover that a shared record lost its last
//! reference. Draining asks each record's factory `is_ready_for_deletion`;
//! records that are not ready are dropped from the set without being
//! destroyed and without being re-scheduled. Callers that still care are
//! expected to re-submit once the record becomes ready.

use hashbrown::HashSet;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::storage::Address;

/// Batch size covers a typical drain without heap allocation.
pub type DrainBatch = SmallVec<[Address; 16]>;

pub struct DeletionManager {
    pending: Mutex<HashSet<Address>>,
}

impl DeletionManager {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Add `address` to the pending set. Duplicate scheduling is tolerated.
    pub fn schedule(&self, address: Address) {
        let mut pending = self.pending.lock();
        if !pending.insert(address) {
            debug!(address, "deletion scheduled twice for the same record");
        }
    }

    /// Remove `address` from the pending set, reporting whether it was
    /// there. Used by the forced-delete path so a drained set never touches
    /// freed memory.
    pub fn unschedule(&self, address: Address) -> bool {
        self.pending.lock().remove(&address)
    }

    pub fn is_scheduled(&self, address: Address) -> bool {
        self.pending.lock().contains(&address)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Take the whole pending set.
    pub fn drain(&self) -> DrainBatch {
        self.pending.lock().drain().collect()
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

impl Default for DeletionManager {
    fn default() -> Self {
        Self::new()
    }
}
