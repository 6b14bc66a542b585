//! # Chunk Store
//!
//! `ChunkStore` is the page store: a byte-addressable arena over the
//! memory-mapped backing file with typed accessors, chunk-granular dirty
//! tracking, and flush. The allocator (`storage::alloc`) layers malloc/free
//! on top of it; everything above that deals in record addresses.
//!
//! ## Addressing
//!
//! An [`Address`] is a byte offset into the file. Address 0 is the universal
//! null sentinel - it points into the header chunk, which never holds
//! records, so no valid record address can be 0.
//!
//! Pointer fields are stored in 4 bytes, compressed by the allocator's
//! 8-byte block granularity: a record address is always `block_start + 2`
//! with `block_start` 8-aligned, so the stored form is
//! `(address - 2) >> 3` and files up to 32 GiB stay addressable. Free-list
//! pointers (block-aligned, internal to the allocator) compress as
//! `address >> 3`.
//!
//! ## Mutation Protocol
//!
//! Every accessor takes `&self`; the store is shared by all reader threads.
//! Writes are gated at runtime by the *exclusive* flag, which the lock
//! manager sets for the duration of the write lock: a write without it is an
//! `IllegalState` error, not UB. Growing or truncating the mapping also
//! happens only in exclusive mode, so no reader can hold a slice across a
//! remap - reads and writes are serialized by the engine's readers-writer
//! lock, which is what makes the internal `UnsafeCell` sound.
//!
//! All accessors bounds-check against the current file size: an out-of-range
//! offset is an error, never a wild read or write.

use std::cell::UnsafeCell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;
use tracing::debug;
use zerocopy::IntoBytes;

use crate::config::{
    BLOCK_HEADER_SIZE, BLOCK_SIZE_DELTA, BLOCK_SIZE_DELTA_BITS, CHUNK_SIZE, MAX_DB_SIZE, PTR_SIZE,
};
use crate::error::StoreError;
use crate::storage::cache::ChunkCache;
use crate::storage::file::MmapFile;
use crate::storage::header::{
    FileHeader, DATA_AREA_OFFSET, ROOT_PTR_SLOTS, VERSION_OFFSET, WRITE_GENERATION_OFFSET,
};

/// Byte offset into the backing file. 0 is the null sentinel.
pub type Address = u64;

/// Snapshot of chunk-level bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    pub total_chunks: u32,
    pub dirty_chunks: usize,
}

pub struct ChunkStore {
    file: UnsafeCell<MmapFile>,
    file_id: u32,
    cache: Arc<ChunkCache>,
    exclusive: AtomicBool,
    pub(crate) mem_stats: Mutex<hashbrown::HashMap<u16, super::alloc::PoolStats>>,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("file_id", &self.file_id)
            .finish_non_exhaustive()
    }
}

// SAFETY: all interior mutation of `file` happens through methods that
// require the exclusive flag, which the lock manager only sets while the
// single writer holds the write lock; readers run only while the flag is
// clear. Remaps (grow/truncate/clear) are writer-only as well, and no
// reference into the mapping escapes the accessors.
unsafe impl Send for ChunkStore {}
unsafe impl Sync for ChunkStore {}

impl ChunkStore {
    /// Create a fresh single-chunk store with an initialized header.
    pub fn create<P: AsRef<Path>>(path: P, cache: Arc<ChunkCache>, version: i32) -> Result<Self> {
        let mut file = MmapFile::create(path, 1)?;

        let header = FileHeader::new(version);
        file.slice_mut(0, std::mem::size_of::<FileHeader>())?
            .copy_from_slice(header.as_bytes());
        file.flush_all()?;

        let file_id = cache.register();
        Ok(Self {
            file: UnsafeCell::new(file),
            file_id,
            cache,
            exclusive: AtomicBool::new(false),
            mem_stats: Mutex::new(hashbrown::HashMap::new()),
        })
    }

    /// Open an existing store, validating the header magic. Structural
    /// problems surface as [`StoreError::IndexCorruption`] so the database
    /// layer can discard and recreate the file.
    pub fn open<P: AsRef<Path>>(path: P, cache: Arc<ChunkCache>) -> Result<Self> {
        let path = path.as_ref();
        let file = match MmapFile::open(path) {
            Ok(file) => file,
            Err(err) => {
                // Missing files are the caller's business; size problems are
                // corruption.
                if path.exists() {
                    return Err(StoreError::IndexCorruption(format!(
                        "unreadable backing file '{}': {err:#}",
                        path.display()
                    ))
                    .into());
                }
                return Err(err);
            }
        };

        FileHeader::from_bytes(file.slice(0, std::mem::size_of::<FileHeader>())?)?;

        let file_id = cache.register();
        Ok(Self {
            file: UnsafeCell::new(file),
            file_id,
            cache,
            exclusive: AtomicBool::new(false),
            mem_stats: Mutex::new(hashbrown::HashMap::new()),
        })
    }

    #[inline]
    fn file(&self) -> &MmapFile {
        // SAFETY: see the Sync justification above; shared reads of the
        // mapping are only concurrent with other reads.
        unsafe { &*self.file.get() }
    }

    /// # Safety contract (internal)
    /// Callers must hold exclusive mode; enforced by `check_write_access` at
    /// every public mutation entry point.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn file_mut(&self) -> &mut MmapFile {
        debug_assert!(self.exclusive.load(Ordering::Relaxed));
        // SAFETY: exclusive mode means this thread is the single writer and
        // no reader is inside an accessor.
        unsafe { &mut *self.file.get() }
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    pub fn chunk_count(&self) -> u32 {
        self.file().chunk_count()
    }

    // ------------------------------------------------------------------
    // exclusive-mode toggling
    // ------------------------------------------------------------------

    pub fn set_exclusive(&self, exclusive: bool) {
        self.exclusive.store(exclusive, Ordering::Release);
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive.load(Ordering::Acquire)
    }

    #[inline]
    fn check_write_access(&self) -> Result<()> {
        if !self.is_exclusive() {
            return Err(StoreError::IllegalState(
                "write attempted without holding the write lock".into(),
            )
            .into());
        }
        Ok(())
    }

    #[inline]
    fn mark_dirty_range(&self, addr: Address, len: u64) {
        if len == 0 {
            return;
        }
        let first = (addr / CHUNK_SIZE as u64) as u32;
        let last = ((addr + len - 1) / CHUNK_SIZE as u64) as u32;
        for chunk in first..=last {
            self.cache.mark_dirty(self.file_id, chunk);
        }
    }

    // ------------------------------------------------------------------
    // typed accessors
    // ------------------------------------------------------------------

    pub fn get_byte(&self, addr: Address) -> Result<u8> {
        Ok(self.file().slice(addr, 1)?[0])
    }

    pub fn put_byte(&self, addr: Address, value: u8) -> Result<()> {
        self.check_write_access()?;
        self.file_mut().slice_mut(addr, 1)?[0] = value;
        self.mark_dirty_range(addr, 1);
        Ok(())
    }

    pub fn get_short(&self, addr: Address) -> Result<i16> {
        let bytes = self.file().slice(addr, 2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn put_short(&self, addr: Address, value: i16) -> Result<()> {
        self.check_write_access()?;
        self.file_mut()
            .slice_mut(addr, 2)?
            .copy_from_slice(&value.to_le_bytes());
        self.mark_dirty_range(addr, 2);
        Ok(())
    }

    pub fn get_int(&self, addr: Address) -> Result<i32> {
        let bytes = self.file().slice(addr, 4)?;
        Ok(i32::from_le_bytes(bytes.try_into().expect("slice is 4 bytes")))
    }

    pub fn put_int(&self, addr: Address, value: i32) -> Result<()> {
        self.check_write_access()?;
        self.file_mut()
            .slice_mut(addr, 4)?
            .copy_from_slice(&value.to_le_bytes());
        self.mark_dirty_range(addr, 4);
        Ok(())
    }

    pub fn get_long(&self, addr: Address) -> Result<i64> {
        let bytes = self.file().slice(addr, 8)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("slice is 8 bytes")))
    }

    pub fn put_long(&self, addr: Address, value: i64) -> Result<()> {
        self.check_write_access()?;
        self.file_mut()
            .slice_mut(addr, 8)?
            .copy_from_slice(&value.to_le_bytes());
        self.mark_dirty_range(addr, 8);
        Ok(())
    }

    /// Read a compressed record pointer. 0 expands to the null address.
    pub fn get_rec_ptr(&self, addr: Address) -> Result<Address> {
        let raw = self.get_int(addr)? as u32;
        if raw == 0 {
            return Ok(0);
        }
        Ok(((raw as u64) << BLOCK_SIZE_DELTA_BITS) + BLOCK_HEADER_SIZE)
    }

    /// Store a compressed record pointer. `value` must be 0 or a record
    /// address (congruent to `BLOCK_HEADER_SIZE` modulo the block granule).
    pub fn put_rec_ptr(&self, addr: Address, value: Address) -> Result<()> {
        if value == 0 {
            return self.put_int(addr, 0);
        }
        if value % BLOCK_SIZE_DELTA as u64 != BLOCK_HEADER_SIZE || value >= MAX_DB_SIZE {
            return Err(StoreError::IllegalArgument(format!(
                "{value:#x} is not a valid record address"
            ))
            .into());
        }
        let compressed = ((value - BLOCK_HEADER_SIZE) >> BLOCK_SIZE_DELTA_BITS) as u32;
        self.put_int(addr, compressed as i32)
    }

    /// Read a compressed block-aligned pointer (allocator internal).
    pub fn get_free_ptr(&self, addr: Address) -> Result<Address> {
        let raw = self.get_int(addr)? as u32;
        Ok((raw as u64) << BLOCK_SIZE_DELTA_BITS)
    }

    /// Store a compressed block-aligned pointer (allocator internal).
    pub fn put_free_ptr(&self, addr: Address, value: Address) -> Result<()> {
        ensure!(
            value % BLOCK_SIZE_DELTA as u64 == 0 && value < MAX_DB_SIZE,
            "{value:#x} is not a block-aligned address"
        );
        self.put_int(addr, (value >> BLOCK_SIZE_DELTA_BITS) as i32)
    }

    /// Copy `len` bytes out of the store.
    pub fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>> {
        Ok(self.file().slice(addr, len)?.to_vec())
    }

    /// Write a byte run into the store.
    pub fn write_bytes(&self, addr: Address, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.check_write_access()?;
        self.file_mut().slice_mut(addr, bytes.len())?.copy_from_slice(bytes);
        self.mark_dirty_range(addr, bytes.len() as u64);
        Ok(())
    }

    /// Zero `len` bytes starting at `addr`.
    pub fn clear_range(&self, addr: Address, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.check_write_access()?;
        self.file_mut().slice_mut(addr, len as usize)?.fill(0);
        self.mark_dirty_range(addr, len);
        Ok(())
    }

    /// Copy `len` bytes from `src` to `dest`. Regions must not overlap.
    pub fn memcpy(&self, dest: Address, src: Address, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.check_write_access()?;
        ensure!(
            src + len <= dest || dest + len <= src,
            "memcpy regions {src:#x}+{len} and {dest:#x}+{len} overlap"
        );
        let data = self.file().slice(src, len as usize)?.to_vec();
        self.file_mut()
            .slice_mut(dest, len as usize)?
            .copy_from_slice(&data);
        self.mark_dirty_range(dest, len);
        Ok(())
    }

    // ------------------------------------------------------------------
    // header fields
    // ------------------------------------------------------------------

    pub fn version(&self) -> Result<i32> {
        self.get_int(VERSION_OFFSET)
    }

    pub fn set_version(&self, version: i32) -> Result<()> {
        self.put_int(VERSION_OFFSET, version)
    }

    pub fn write_generation(&self) -> Result<u64> {
        Ok(self.get_long(WRITE_GENERATION_OFFSET)? as u64)
    }

    pub fn bump_write_generation(&self) -> Result<u64> {
        let next = self.write_generation()? + 1;
        self.put_long(WRITE_GENERATION_OFFSET, next as i64)?;
        Ok(next)
    }

    fn root_slot_addr(&self, slot: u32) -> Result<Address> {
        if slot >= ROOT_PTR_SLOTS {
            return Err(StoreError::IllegalArgument(format!(
                "root pointer slot {slot} out of range (max {ROOT_PTR_SLOTS})"
            ))
            .into());
        }
        Ok(DATA_AREA_OFFSET + slot as u64 * PTR_SIZE)
    }

    /// Read a root pointer slot from the header data area.
    pub fn root_ptr(&self, slot: u32) -> Result<Address> {
        let addr = self.root_slot_addr(slot)?;
        self.get_rec_ptr(addr)
    }

    /// Store a root pointer slot in the header data area.
    pub fn put_root_ptr(&self, slot: u32, value: Address) -> Result<()> {
        let addr = self.root_slot_addr(slot)?;
        self.put_rec_ptr(addr, value)
    }

    // ------------------------------------------------------------------
    // growth, clear, flush
    // ------------------------------------------------------------------

    /// Append `count` zeroed chunks to the file, returning the index of the
    /// first new chunk.
    pub(crate) fn create_new_chunks(&self, count: u32) -> Result<u32> {
        self.check_write_access()?;
        let first = self.chunk_count();
        let new_count = first
            .checked_add(count)
            .ok_or_else(|| eyre::eyre!("chunk count overflow"))?;
        ensure!(
            (new_count as u64) * CHUNK_SIZE as u64 <= MAX_DB_SIZE,
            "database would exceed the maximum size of {MAX_DB_SIZE} bytes"
        );
        self.file_mut().grow(new_count)?;
        Ok(first)
    }

    /// Reset the store to a single freshly-initialized header chunk.
    pub fn clear(&self, version: i32) -> Result<()> {
        self.check_write_access()?;

        let file = self.file_mut();
        file.truncate(1)?;
        file.slice_mut(0, CHUNK_SIZE)?.fill(0);
        let header = FileHeader::new(version);
        file.slice_mut(0, std::mem::size_of::<FileHeader>())?
            .copy_from_slice(header.as_bytes());

        self.cache.forget(self.file_id);
        self.mem_stats.lock().clear();
        self.file().flush_all()?;
        debug!(version, "store cleared");
        Ok(())
    }

    pub fn dirty_chunk_count(&self) -> usize {
        self.cache.dirty_count(self.file_id)
    }

    pub fn chunk_stats(&self) -> ChunkStats {
        ChunkStats {
            total_chunks: self.chunk_count(),
            dirty_chunks: self.dirty_chunk_count(),
        }
    }

    /// Persist every dirty chunk, coalescing adjacent chunks into ranged
    /// syncs. Returns the number of chunks flushed.
    pub fn flush(&self) -> Result<usize> {
        let chunks = self.cache.drain_dirty(self.file_id);
        if chunks.is_empty() {
            return Ok(0);
        }

        let file = self.file();
        let mut flushed = 0usize;
        let mut run_start = chunks[0];
        let mut run_len = 1u32;
        for &chunk in &chunks[1..] {
            if chunk == run_start + run_len {
                run_len += 1;
            } else {
                file.flush_chunks(run_start, run_len)?;
                flushed += run_len as usize;
                run_start = chunk;
                run_len = 1;
            }
        }
        file.flush_chunks(run_start, run_len)?;
        flushed += run_len as usize;

        debug!(flushed, "flushed dirty chunks");
        Ok(flushed)
    }

    /// Advise the kernel that a chunk run is about to be scanned.
    pub fn prefetch(&self, addr: Address, len: u64) {
        if len == 0 {
            return;
        }
        let first = (addr / CHUNK_SIZE as u64) as u32;
        let last = ((addr + len - 1) / CHUNK_SIZE as u64) as u32;
        self.file().prefetch_chunks(first, last - first + 1);
    }
}
