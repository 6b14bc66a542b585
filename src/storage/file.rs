//! # Memory-Mapped Backing File
//!
//! `MmapFile` is the low-level building block for the chunked backing file.
//! The file is mapped into the process address space and accessed as byte
//! slices; the OS handles paging, so cached chunk reads cost a pointer
//! dereference and no syscalls.
//!
//! ## Safety Model
//!
//! A memory-mapped region becomes invalid when the file is grown or shrunk
//! and remapped. Rather than runtime guards, this type leans on the borrow
//! checker:
//!
//! ```text
//! slice(&self, ..) -> &[u8]          // immutable borrow of self
//! slice_mut(&mut self, ..) -> &mut [u8]
//! grow(&mut self) / truncate(&mut self)  // exclusive borrow
//! ```
//!
//! No slice can be live across a remap at compile time. The engine-level
//! locking protocol (writes only under the exclusive lock) governs which
//! thread gets to call the `&mut self` methods; see `storage::store`.
//!
//! ## File Format
//!
//! The file is a plain concatenation of fixed-size chunks. Chunk 0 holds the
//! header (see `storage::header`); the file size is always a multiple of
//! [`CHUNK_SIZE`].
//!
//! ## Durability
//!
//! `flush_range` / `flush_all` msync the mapped region. Flushing a range
//! only persists the chunks the caller knows to be dirty, which is what the
//! dirty-chunk tracker feeds us.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::CHUNK_SIZE;

#[derive(Debug)]
pub struct MmapFile {
    file: File,
    mmap: MmapMut,
    chunk_count: u32,
}

impl MmapFile {
    /// Open an existing backing file. Fails if the file is empty or its size
    /// is not a whole number of chunks; the caller decides whether that
    /// means rebuild-from-scratch.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot map empty database file '{}'",
            path.display()
        );

        ensure!(
            file_size % CHUNK_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of chunk size {}",
            path.display(),
            file_size,
            CHUNK_SIZE
        );

        let chunk_count = (file_size / CHUNK_SIZE as u64) as u32;

        // SAFETY: map_mut is unsafe because the file could be modified
        // externally. This is safe because:
        // 1. The file is opened read+write and database files are not meant
        //    to be touched by other processes.
        // 2. The mmap lifetime is tied to MmapFile, preventing use-after-unmap.
        // 3. All access goes through slice()/slice_mut() which bounds-check.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            chunk_count,
        })
    }

    /// Create (or truncate) a backing file with `initial_chunks` zeroed
    /// chunks.
    pub fn create<P: AsRef<Path>>(path: P, initial_chunks: u32) -> Result<Self> {
        let path = path.as_ref();

        ensure!(initial_chunks > 0, "initial chunk count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create database file '{}'", path.display()))?;

        let file_size = initial_chunks as u64 * CHUNK_SIZE as u64;

        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to size file to {file_size} bytes"))?;

        // SAFETY: same reasoning as in open(); additionally the file was just
        // created with truncate=true, so no other mapping exists.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            chunk_count: initial_chunks,
        })
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn file_size(&self) -> u64 {
        self.chunk_count as u64 * CHUNK_SIZE as u64
    }

    /// Immutable view of `len` bytes at `offset`.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        self.check_bounds(offset, len)?;
        let offset = offset as usize;
        Ok(&self.mmap[offset..offset + len])
    }

    /// Mutable view of `len` bytes at `offset`.
    pub fn slice_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        self.check_bounds(offset, len)?;
        let offset = offset as usize;
        Ok(&mut self.mmap[offset..offset + len])
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| eyre::eyre!("address overflow at offset {offset:#x}"))?;
        ensure!(
            end <= self.file_size(),
            "access at {:#x}..{:#x} out of bounds (file size {:#x})",
            offset,
            end,
            self.file_size()
        );
        Ok(())
    }

    /// Extend the file to `new_chunk_count` chunks and remap. No-op if the
    /// file is already at least that large.
    pub fn grow(&mut self, new_chunk_count: u32) -> Result<()> {
        if new_chunk_count <= self.chunk_count {
            return Ok(());
        }

        self.mmap.flush().wrap_err("failed to flush mmap before grow")?;

        let new_size = new_chunk_count as u64 * CHUNK_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {new_size} bytes"))?;

        // SAFETY: grow() takes &mut self, so no slices into the old mapping
        // exist. The old mmap was flushed above and is dropped on assignment;
        // the file has already been extended to new_size.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.chunk_count = new_chunk_count;
        Ok(())
    }

    /// Shrink the file to `new_chunk_count` chunks and remap. Used by
    /// `clear()` to reset the database to just the header chunk.
    pub fn truncate(&mut self, new_chunk_count: u32) -> Result<()> {
        ensure!(new_chunk_count > 0, "cannot truncate below one chunk");
        if new_chunk_count >= self.chunk_count {
            return Ok(());
        }

        let new_size = new_chunk_count as u64 * CHUNK_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to truncate file to {new_size} bytes"))?;

        // SAFETY: &mut self guarantees no outstanding slices; the shrunken
        // file is remapped before any further access.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap file after truncate")?
        };

        self.chunk_count = new_chunk_count;
        Ok(())
    }

    /// Persist a chunk run `[first_chunk, first_chunk + count)` to disk.
    pub fn flush_chunks(&self, first_chunk: u32, count: u32) -> Result<()> {
        let end = first_chunk.saturating_add(count).min(self.chunk_count);
        if end <= first_chunk {
            return Ok(());
        }
        let offset = first_chunk as usize * CHUNK_SIZE;
        let len = (end - first_chunk) as usize * CHUNK_SIZE;
        self.mmap
            .flush_range(offset, len)
            .wrap_err_with(|| format!("failed to flush chunks {first_chunk}..{end}"))
    }

    /// Persist the whole mapping.
    pub fn flush_all(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to flush mmap to disk")
    }

    /// Hint the kernel that a chunk run is about to be scanned.
    pub fn prefetch_chunks(&self, first_chunk: u32, count: u32) {
        if first_chunk >= self.chunk_count {
            return;
        }
        let end = first_chunk.saturating_add(count).min(self.chunk_count);
        let offset = first_chunk as usize * CHUNK_SIZE;
        let len = (end - first_chunk) as usize * CHUNK_SIZE;

        #[cfg(unix)]
        // SAFETY: offset and len were clamped to the mapping above; madvise
        // with MADV_WILLNEED is advisory and does not fault on valid ranges.
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(offset) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }
        #[cfg(not(unix))]
        let _ = (offset, len);
    }
}
