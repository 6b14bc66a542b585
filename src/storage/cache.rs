//! # Shared Chunk Cache
//!
//! One `ChunkCache` is shared by every database open in the process. It does
//! two jobs:
//!
//! 1. Hands out a `file_id` to each database, namespacing the dirty sets.
//! 2. Tracks the set of dirty chunks per database, sharded by file id so
//!    concurrent databases do not contend on one mutex.
//!
//! The configured chunk capacity is what the write-lock release path
//! measures its dirty ratio against: once a database's dirty chunk count
//! exceeds `capacity / DIRTY_FLUSH_DIVISOR`, releasing the write lock forces
//! a flush.
//!
//! With a memory-mapped backing file the chunk *data* already lives in the
//! OS page cache; what this type centralizes is the bookkeeping the OS does
//! not give us - which chunks our writes touched and how many of them are
//! waiting for a flush.
//!
//! ## Thread Safety
//!
//! Each shard is a `parking_lot::Mutex` around a `file_id -> dirty set` map.
//! Shard selection is deterministic on file id, so all operations for one
//! database serialize on the same shard while leaving other shards free.

use std::sync::atomic::{AtomicU32, Ordering};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::config::{DEFAULT_CACHE_CHUNKS, DIRTY_FLUSH_DIVISOR, DIRTY_SHARD_COUNT};

pub struct ChunkCache {
    capacity_chunks: usize,
    next_file_id: AtomicU32,
    shards: [Mutex<HashMap<u32, HashSet<u32>>>; DIRTY_SHARD_COUNT],
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CHUNKS)
    }

    /// `capacity_chunks` is the nominal chunk budget shared by all databases
    /// using this cache; it only drives the flush heuristic.
    pub fn with_capacity(capacity_chunks: usize) -> Self {
        Self {
            capacity_chunks: capacity_chunks.max(1),
            next_file_id: AtomicU32::new(0),
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    /// Reserve a file id for a newly opened database.
    pub fn register(&self) -> u32 {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn capacity_chunks(&self) -> usize {
        self.capacity_chunks
    }

    /// Dirty chunk count at which a write-lock release forces a flush.
    pub fn flush_threshold(&self) -> usize {
        self.capacity_chunks / DIRTY_FLUSH_DIVISOR
    }

    #[inline]
    fn shard_for(&self, file_id: u32) -> &Mutex<HashMap<u32, HashSet<u32>>> {
        &self.shards[file_id as usize % DIRTY_SHARD_COUNT]
    }

    #[inline]
    pub fn mark_dirty(&self, file_id: u32, chunk: u32) {
        let mut shard = self.shard_for(file_id).lock();
        shard.entry(file_id).or_default().insert(chunk);
    }

    pub fn dirty_count(&self, file_id: u32) -> usize {
        let shard = self.shard_for(file_id).lock();
        shard.get(&file_id).map(|set| set.len()).unwrap_or(0)
    }

    /// Take the dirty set for a database, sorted ascending so the flusher
    /// can coalesce adjacent chunks into ranged msyncs.
    pub fn drain_dirty(&self, file_id: u32) -> Vec<u32> {
        let mut chunks: Vec<u32> = {
            let mut shard = self.shard_for(file_id).lock();
            match shard.get_mut(&file_id) {
                Some(set) => set.drain().collect(),
                None => Vec::new(),
            }
        };
        chunks.sort_unstable();
        chunks
    }

    /// Forget all dirty state for a database (used by `clear()` and close).
    pub fn forget(&self, file_id: u32) {
        let mut shard = self.shard_for(file_id).lock();
        shard.remove(&file_id);
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_drain_sorted() {
        let cache = ChunkCache::new();
        let id = cache.register();

        cache.mark_dirty(id, 30);
        cache.mark_dirty(id, 10);
        cache.mark_dirty(id, 20);
        cache.mark_dirty(id, 10);

        assert_eq!(cache.dirty_count(id), 3);
        assert_eq!(cache.drain_dirty(id), vec![10, 20, 30]);
        assert_eq!(cache.dirty_count(id), 0);
    }

    #[test]
    fn databases_are_independent() {
        let cache = ChunkCache::new();
        let a = cache.register();
        let b = cache.register();
        assert_ne!(a, b);

        cache.mark_dirty(a, 1);
        cache.mark_dirty(b, 2);

        assert_eq!(cache.dirty_count(a), 1);
        cache.forget(a);
        assert_eq!(cache.dirty_count(a), 0);
        assert_eq!(cache.dirty_count(b), 1);
    }

    #[test]
    fn flush_threshold_is_quarter_of_capacity() {
        let cache = ChunkCache::with_capacity(1024);
        assert_eq!(cache.flush_threshold(), 256);
    }

    #[test]
    fn drain_empty_is_empty() {
        let cache = ChunkCache::new();
        let id = cache.register();
        assert!(cache.drain_dirty(id).is_empty());
    }
}
