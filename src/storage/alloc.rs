//! # Block Allocator
//!
//! malloc/free over the chunk store. Terminology: a *block* is a
//! variable-size piece of contiguous storage returned by `malloc`; a *chunk*
//! is the fixed-size paging unit. Most chunks contain several blocks; a
//! block larger than [`MAX_SINGLE_BLOCK_MALLOC_SIZE`] instead spans a whole
//! run of chunks and is called a *large block*.
//!
//! ## Small blocks
//!
//! Sizes are multiples of [`BLOCK_SIZE_DELTA`] (8 bytes). Every block starts
//! with a 2-byte signed size header: negative while in use, positive while
//! free, zero identifying a large block. Free blocks additionally carry
//! prev/next links right after the header and are threaded into one free
//! list per size class; the list heads live in the header chunk's malloc
//! table, so the free space survives reopen byte-for-byte.
//!
//! ```text
//! free block:   [ size:i16 > 0 ][ prev:u32 ][ next:u32 ][ ... ]
//! in-use block: [ size:i16 < 0 ][ payload ... ]
//! large block:  payload preceded by i16 == 0 (see below)
//! ```
//!
//! `malloc` rounds the request up to a size class, takes the first free
//! block from the smallest class that fits (splitting off the tail when the
//! leftover is itself a usable block), or carves a fresh chunk into one
//! maximal free block when every list is empty. Payloads are zero-filled.
//!
//! ## Large blocks
//!
//! A large block owns `n` contiguous chunks with an `i32` chunk count at the
//! start of the first chunk (negative in use, positive free), prev/next
//! chunk-number links for the free list, and a replica of the count in the
//! last 4 bytes of the run. Free runs sit in a single first-fit list whose
//! head is a header field. The two bytes immediately before a large block's
//! payload are always zero, which is how `free` tells the two kinds apart.
//!
//! ## Pools
//!
//! Every allocation carries a pool id that classifies it for accounting
//! (live bytes and allocation counts per pool); record types use
//! `POOL_FIRST_NODE_TYPE + tag`, growable-array storage uses
//! `POOL_GROWABLE_ARRAY`. Free space is shared across pools by size class.

use eyre::{ensure, Result};

use crate::config::{
    BLOCK_HEADER_SIZE, BLOCK_SIZE_DELTA, CHUNK_SIZE, INT_SIZE, LARGE_BLOCK_FOOTER_SIZE,
    LARGE_BLOCK_HEADER_SIZE, MAX_BLOCK_DELTAS, MAX_SINGLE_BLOCK_MALLOC_SIZE, MIN_BLOCK_DELTAS,
};
use crate::error::StoreError;
use crate::storage::header::{LARGE_FREE_HEAD_OFFSET, MALLOC_TABLE_OFFSET};
use crate::storage::store::{Address, ChunkStore};

// Free-block link offsets, relative to the block start.
const BLOCK_PREV_OFFSET: u64 = BLOCK_HEADER_SIZE;
const BLOCK_NEXT_OFFSET: u64 = BLOCK_HEADER_SIZE + 4;

// Large-block field offsets, relative to the first chunk of the run.
const LARGE_SIZE_OFFSET: u64 = 0;
const LARGE_PREV_OFFSET: u64 = INT_SIZE;
const LARGE_NEXT_OFFSET: u64 = 2 * INT_SIZE;

/// Per-pool accounting. `live_bytes` counts block sizes including headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live_bytes: u64,
    pub allocations: u64,
    pub frees: u64,
}

impl ChunkStore {
    /// Allocate `size` payload bytes from `pool`. The payload is zero-filled
    /// and preceded by the block header; the returned address is stable for
    /// the life of the block.
    pub fn malloc(&self, size: u64, pool: u16) -> Result<Address> {
        ensure!(size > 0, "cannot allocate an empty block");

        let (addr, used_bytes) = if size as usize > MAX_SINGLE_BLOCK_MALLOC_SIZE {
            self.malloc_large(size)?
        } else {
            self.malloc_small(size as usize)?
        };

        let mut stats = self.mem_stats.lock();
        let entry = stats.entry(pool).or_default();
        entry.live_bytes += used_bytes;
        entry.allocations += 1;

        Ok(addr)
    }

    /// Return a block to the free space of the store.
    pub fn free(&self, addr: Address, pool: u16) -> Result<()> {
        ensure!(addr >= BLOCK_HEADER_SIZE, "free of invalid address {addr:#x}");
        let header = self.get_short(addr - BLOCK_HEADER_SIZE)?;

        let freed_bytes = if header == 0 {
            self.free_large(addr)?
        } else if header < 0 {
            self.free_small(addr, u64::from(header.unsigned_abs()))?
        } else {
            return Err(StoreError::IllegalState(format!(
                "double free at {addr:#x}: block is already on a free list"
            ))
            .into());
        };

        let mut stats = self.mem_stats.lock();
        let entry = stats.entry(pool).or_default();
        entry.live_bytes = entry.live_bytes.saturating_sub(freed_bytes);
        entry.frees += 1;
        Ok(())
    }

    /// Snapshot of per-pool accounting, sorted by pool id.
    pub fn memory_stats(&self) -> Vec<(u16, PoolStats)> {
        let stats = self.mem_stats.lock();
        let mut out: Vec<(u16, PoolStats)> = stats.iter().map(|(&k, &v)| (k, v)).collect();
        out.sort_unstable_by_key(|&(pool, _)| pool);
        out
    }

    // ------------------------------------------------------------------
    // small blocks
    // ------------------------------------------------------------------

    fn malloc_table_entry(deltas: usize) -> u64 {
        MALLOC_TABLE_OFFSET + ((deltas - MIN_BLOCK_DELTAS) as u64) * INT_SIZE
    }

    fn malloc_small(&self, size: usize) -> Result<(Address, u64)> {
        let need_deltas =
            ((size + BLOCK_HEADER_SIZE as usize + BLOCK_SIZE_DELTA - 1) / BLOCK_SIZE_DELTA)
                .max(MIN_BLOCK_DELTAS);

        // Smallest size class with a free block.
        let mut free_block: Address = 0;
        let mut use_deltas = need_deltas;
        while use_deltas <= MAX_BLOCK_DELTAS {
            free_block = self.get_free_ptr(Self::malloc_table_entry(use_deltas))?;
            if free_block != 0 {
                break;
            }
            use_deltas += 1;
        }

        if free_block == 0 {
            // Carve a fresh chunk into one maximal free block, then retry
            // with that block in hand.
            let chunk = self.acquire_chunk_run(1)?;
            self.set_large_block_header(chunk, -1)?;
            free_block = chunk as u64 * CHUNK_SIZE as u64 + LARGE_BLOCK_HEADER_SIZE as u64;
            use_deltas = MAX_BLOCK_DELTAS;
            self.put_short(free_block, (use_deltas * BLOCK_SIZE_DELTA) as i16)?;
        } else {
            let reported = self.get_short(free_block)?;
            if reported as usize != use_deltas * BLOCK_SIZE_DELTA {
                return Err(StoreError::IndexCorruption(format!(
                    "free block at {free_block:#x} reports size {reported} but sits in the \
                     list for size {}",
                    use_deltas * BLOCK_SIZE_DELTA
                ))
                .into());
            }
            self.remove_free_block(free_block, use_deltas * BLOCK_SIZE_DELTA)?;
        }

        // Split off the unused tail when it is itself a usable block.
        let unused_deltas = use_deltas - need_deltas;
        if unused_deltas >= MIN_BLOCK_DELTAS {
            self.add_free_block(
                free_block + (need_deltas * BLOCK_SIZE_DELTA) as u64,
                unused_deltas * BLOCK_SIZE_DELTA,
            )?;
            use_deltas = need_deltas;
        }

        let used_size = use_deltas * BLOCK_SIZE_DELTA;
        self.put_short(free_block, -(used_size as i16))?;
        self.clear_range(
            free_block + BLOCK_HEADER_SIZE,
            (used_size as u64) - BLOCK_HEADER_SIZE,
        )?;

        Ok((free_block + BLOCK_HEADER_SIZE, used_size as u64))
    }

    fn free_small(&self, addr: Address, size: u64) -> Result<u64> {
        let block = addr - BLOCK_HEADER_SIZE;
        ensure!(
            size as usize >= MIN_BLOCK_DELTAS * BLOCK_SIZE_DELTA
                && size as usize <= MAX_BLOCK_DELTAS * BLOCK_SIZE_DELTA
                && size as usize % BLOCK_SIZE_DELTA == 0,
            "freed block at {addr:#x} has impossible size {size}"
        );
        self.add_free_block(block, size as usize)?;
        Ok(size)
    }

    /// Push a free block onto the head of its size-class list.
    fn add_free_block(&self, block: Address, size: usize) -> Result<()> {
        let deltas = size / BLOCK_SIZE_DELTA;
        let table = Self::malloc_table_entry(deltas);
        let head = self.get_free_ptr(table)?;

        self.put_short(block, size as i16)?;
        self.put_free_ptr(block + BLOCK_PREV_OFFSET, 0)?;
        self.put_free_ptr(block + BLOCK_NEXT_OFFSET, head)?;
        if head != 0 {
            self.put_free_ptr(head + BLOCK_PREV_OFFSET, block)?;
        }
        self.put_free_ptr(table, block)
    }

    /// Unlink a free block from its size-class list.
    fn remove_free_block(&self, block: Address, size: usize) -> Result<()> {
        let prev = self.get_free_ptr(block + BLOCK_PREV_OFFSET)?;
        let next = self.get_free_ptr(block + BLOCK_NEXT_OFFSET)?;

        if prev != 0 {
            self.put_free_ptr(prev + BLOCK_NEXT_OFFSET, next)?;
        } else {
            let deltas = size / BLOCK_SIZE_DELTA;
            self.put_free_ptr(Self::malloc_table_entry(deltas), next)?;
        }
        if next != 0 {
            self.put_free_ptr(next + BLOCK_PREV_OFFSET, prev)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // large blocks
    // ------------------------------------------------------------------

    fn set_large_block_header(&self, chunk: u32, count: i32) -> Result<()> {
        let base = chunk as u64 * CHUNK_SIZE as u64;
        let chunks = count.unsigned_abs() as u64;
        self.put_int(base + LARGE_SIZE_OFFSET, count)?;
        self.put_int(
            base + chunks * CHUNK_SIZE as u64 - LARGE_BLOCK_FOOTER_SIZE as u64,
            count,
        )
    }

    fn malloc_large(&self, size: u64) -> Result<(Address, u64)> {
        let overhead =
            (BLOCK_HEADER_SIZE as usize + LARGE_BLOCK_HEADER_SIZE + LARGE_BLOCK_FOOTER_SIZE) as u64;
        let chunks_needed =
            ((size + overhead + CHUNK_SIZE as u64 - 1) / CHUNK_SIZE as u64) as u32;

        let chunk = self.acquire_chunk_run(chunks_needed)?;
        self.set_large_block_header(chunk, -(chunks_needed as i32))?;

        let base = chunk as u64 * CHUNK_SIZE as u64;
        let data_len = chunks_needed as u64 * CHUNK_SIZE as u64
            - LARGE_BLOCK_HEADER_SIZE as u64
            - LARGE_BLOCK_FOOTER_SIZE as u64;
        // Zeroing the whole interior also zeroes the i16 in front of the
        // payload, which is the mark distinguishing large from small blocks.
        self.clear_range(base + LARGE_BLOCK_HEADER_SIZE as u64, data_len)?;

        Ok((
            base + LARGE_BLOCK_HEADER_SIZE as u64 + BLOCK_HEADER_SIZE,
            chunks_needed as u64 * CHUNK_SIZE as u64,
        ))
    }

    fn free_large(&self, addr: Address) -> Result<u64> {
        let base = addr - BLOCK_HEADER_SIZE - LARGE_BLOCK_HEADER_SIZE as u64;
        if base % CHUNK_SIZE as u64 != 0 {
            return Err(StoreError::IndexCorruption(format!(
                "large block payload at {addr:#x} is not chunk-aligned"
            ))
            .into());
        }
        let chunk = (base / CHUNK_SIZE as u64) as u32;
        let count = self.get_int(base + LARGE_SIZE_OFFSET)?;
        if count >= 0 {
            return Err(StoreError::IllegalState(format!(
                "double free of large block at chunk {chunk}"
            ))
            .into());
        }

        self.link_free_run(chunk, count.unsigned_abs())?;
        Ok(count.unsigned_abs() as u64 * CHUNK_SIZE as u64)
    }

    /// First-fit search of the free run list, splitting oversized runs.
    /// Falls back to appending fresh chunks to the file.
    fn acquire_chunk_run(&self, chunks_needed: u32) -> Result<u32> {
        let mut cursor = self.get_int(LARGE_FREE_HEAD_OFFSET)? as u32;
        while cursor != 0 {
            let base = cursor as u64 * CHUNK_SIZE as u64;
            let run_len = self.get_int(base + LARGE_SIZE_OFFSET)?;
            if run_len <= 0 {
                return Err(StoreError::IndexCorruption(format!(
                    "free run list contains in-use chunk {cursor}"
                ))
                .into());
            }
            let run_len = run_len as u32;
            if run_len >= chunks_needed {
                self.unlink_free_run(cursor)?;
                if run_len > chunks_needed {
                    // Keep the head of the run, return the tail to the list.
                    self.link_free_run(cursor + chunks_needed, run_len - chunks_needed)?;
                }
                return Ok(cursor);
            }
            cursor = self.get_int(base + LARGE_NEXT_OFFSET)? as u32;
        }

        self.create_new_chunks(chunks_needed)
    }

    fn link_free_run(&self, chunk: u32, count: u32) -> Result<()> {
        let base = chunk as u64 * CHUNK_SIZE as u64;
        let head = self.get_int(LARGE_FREE_HEAD_OFFSET)? as u32;

        self.set_large_block_header(chunk, count as i32)?;
        self.put_int(base + LARGE_PREV_OFFSET, 0)?;
        self.put_int(base + LARGE_NEXT_OFFSET, head as i32)?;
        if head != 0 {
            self.put_int(head as u64 * CHUNK_SIZE as u64 + LARGE_PREV_OFFSET, chunk as i32)?;
        }
        self.put_int(LARGE_FREE_HEAD_OFFSET, chunk as i32)
    }

    fn unlink_free_run(&self, chunk: u32) -> Result<()> {
        let base = chunk as u64 * CHUNK_SIZE as u64;
        let prev = self.get_int(base + LARGE_PREV_OFFSET)? as u32;
        let next = self.get_int(base + LARGE_NEXT_OFFSET)? as u32;

        if prev != 0 {
            self.put_int(prev as u64 * CHUNK_SIZE as u64 + LARGE_NEXT_OFFSET, next as i32)?;
        } else {
            self.put_int(LARGE_FREE_HEAD_OFFSET, next as i32)?;
        }
        if next != 0 {
            self.put_int(next as u64 * CHUNK_SIZE as u64 + LARGE_PREV_OFFSET, prev as i32)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::POOL_MISC;
    use crate::storage::cache::ChunkCache;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn exclusive_store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ChunkCache::new());
        let store = ChunkStore::create(dir.path().join("alloc.db"), cache, 1).unwrap();
        store.set_exclusive(true);
        (dir, store)
    }

    #[test]
    fn malloc_is_zero_filled_and_aligned() {
        let (_dir, store) = exclusive_store();

        let addr = store.malloc(40, POOL_MISC).unwrap();
        assert_eq!(addr % BLOCK_SIZE_DELTA as u64, BLOCK_HEADER_SIZE);
        for i in 0..40 {
            assert_eq!(store.get_byte(addr + i).unwrap(), 0);
        }
    }

    #[test]
    fn free_then_malloc_reuses_the_block() {
        let (_dir, store) = exclusive_store();

        let a = store.malloc(100, POOL_MISC).unwrap();
        store.put_long(a, 0x5555).unwrap();
        store.free(a, POOL_MISC).unwrap();

        let b = store.malloc(100, POOL_MISC).unwrap();
        assert_eq!(b, a);
        // Reused blocks come back zeroed.
        assert_eq!(store.get_long(b).unwrap(), 0);
    }

    #[test]
    fn distinct_blocks_do_not_overlap() {
        let (_dir, store) = exclusive_store();

        let mut addrs = Vec::new();
        for _ in 0..64 {
            addrs.push(store.malloc(48, POOL_MISC).unwrap());
        }
        for (i, &a) in addrs.iter().enumerate() {
            store.put_long(a, i as i64).unwrap();
        }
        for (i, &a) in addrs.iter().enumerate() {
            assert_eq!(store.get_long(a).unwrap(), i as i64);
        }
    }

    #[test]
    fn double_free_is_detected() {
        let (_dir, store) = exclusive_store();

        let a = store.malloc(32, POOL_MISC).unwrap();
        store.free(a, POOL_MISC).unwrap();
        let err = store.free(a, POOL_MISC).unwrap_err();
        assert!(StoreError::is_illegal_state(&err));
    }

    #[test]
    fn large_blocks_roundtrip() {
        let (_dir, store) = exclusive_store();

        let size = 3 * CHUNK_SIZE as u64;
        let addr = store.malloc(size, POOL_MISC).unwrap();
        assert_eq!(addr % BLOCK_SIZE_DELTA as u64, BLOCK_HEADER_SIZE);
        // The large-block mark: two zero bytes before the payload.
        assert_eq!(store.get_short(addr - BLOCK_HEADER_SIZE).unwrap(), 0);

        store.put_long(addr + size - 8, 0x77).unwrap();
        assert_eq!(store.get_long(addr + size - 8).unwrap(), 0x77);

        let chunks_before = store.chunk_count();
        store.free(addr, POOL_MISC).unwrap();

        // The freed run is reused instead of growing the file.
        let again = store.malloc(size, POOL_MISC).unwrap();
        assert_eq!(again, addr);
        assert_eq!(store.chunk_count(), chunks_before);
    }

    #[test]
    fn oversized_free_run_is_split() {
        let (_dir, store) = exclusive_store();

        let big = store.malloc(8 * CHUNK_SIZE as u64, POOL_MISC).unwrap();
        store.free(big, POOL_MISC).unwrap();
        let chunks_before = store.chunk_count();

        let small = store.malloc(2 * CHUNK_SIZE as u64, POOL_MISC).unwrap();
        assert_eq!(small, big);
        // Second allocation comes out of the remainder of the same run.
        let second = store.malloc(2 * CHUNK_SIZE as u64, POOL_MISC).unwrap();
        assert_ne!(second, small);
        assert_eq!(store.chunk_count(), chunks_before);
    }

    #[test]
    fn pool_stats_track_live_bytes() {
        let (_dir, store) = exclusive_store();

        let a = store.malloc(100, 7).unwrap();
        let stats = store.memory_stats();
        let (pool, s) = stats.iter().find(|(p, _)| *p == 7).unwrap();
        assert_eq!(*pool, 7);
        assert!(s.live_bytes >= 100);
        assert_eq!(s.allocations, 1);

        store.free(a, 7).unwrap();
        let stats = store.memory_stats();
        let (_, s) = stats.iter().find(|(p, _)| *p == 7).unwrap();
        assert_eq!(s.live_bytes, 0);
        assert_eq!(s.frees, 1);
    }

    #[test]
    fn free_lists_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alloc.db");
        let cache = Arc::new(ChunkCache::new());

        let freed;
        {
            let store = ChunkStore::create(&path, Arc::clone(&cache), 1).unwrap();
            store.set_exclusive(true);
            freed = store.malloc(64, POOL_MISC).unwrap();
            let _keep = store.malloc(64, POOL_MISC).unwrap();
            store.free(freed, POOL_MISC).unwrap();
            store.flush().unwrap();
        }

        let store = ChunkStore::open(&path, cache).unwrap();
        store.set_exclusive(true);
        let again = store.malloc(64, POOL_MISC).unwrap();
        assert_eq!(again, freed);
    }

    #[test]
    fn malloc_smaller_than_minimum_class_still_works() {
        let (_dir, store) = exclusive_store();
        let a = store.malloc(1, POOL_MISC).unwrap();
        let b = store.malloc(1, POOL_MISC).unwrap();
        assert_ne!(a, b);
        store.put_byte(a, 0xFF).unwrap();
        assert_eq!(store.get_byte(b).unwrap(), 0);
    }
}
