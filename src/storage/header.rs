//! # Header Chunk Layout
//!
//! Chunk 0 of the backing file is the header chunk. Its fixed prefix is a
//! zerocopy struct ([`FileHeader`]); the remainder holds the allocator's
//! malloc table and a data area of root pointer slots callers use to anchor
//! their object graphs.
//!
//! ```text
//! offset                content
//!                       _____________________________
//! 0                    | magic (8 bytes)
//! 8                    | schema version (u32)
//! 12                   | flags (u32, reserved)
//! 16                   | write generation (u64, bumped on write-lock release)
//! 24                   | large-block free list head (chunk number, u32)
//! 28                   | reserved (u32)
//! MALLOC_TABLE_OFFSET  | free-list head per small size class (u32 each)
//! DATA_AREA_OFFSET     | root pointer slots (remainder of the chunk)
//! ```
//!
//! All multi-byte fields are little-endian; the zerocopy `U32`/`U64` wrappers
//! handle conversion and keep the struct valid for unaligned reads out of the
//! mapping.

use eyre::Result;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{CHUNK_SIZE, INT_SIZE, MALLOC_TABLE_ENTRIES, PTR_SIZE};
use crate::error::StoreError;

pub const MAGIC: &[u8; 8] = b"tagdb\x00v1";

pub const FILE_HEADER_SIZE: usize = 32;

pub const VERSION_OFFSET: u64 = 8;
pub const WRITE_GENERATION_OFFSET: u64 = 16;
pub const LARGE_FREE_HEAD_OFFSET: u64 = 24;

/// One u32 free-list head per small size class.
pub const MALLOC_TABLE_OFFSET: u64 = FILE_HEADER_SIZE as u64;

/// Start of the root-pointer data area.
pub const DATA_AREA_OFFSET: u64 =
    MALLOC_TABLE_OFFSET + (MALLOC_TABLE_ENTRIES as u64) * INT_SIZE;

/// Number of root pointer slots available to callers.
pub const ROOT_PTR_SLOTS: u32 = ((CHUNK_SIZE as u64 - DATA_AREA_OFFSET) / PTR_SIZE) as u32;

const _: () = assert!(
    DATA_AREA_OFFSET as usize + PTR_SIZE as usize <= CHUNK_SIZE,
    "fixed header plus malloc table must leave room for the data area"
);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 8],
    version: U32,
    flags: U32,
    write_generation: U64,
    large_free_head: U32,
    reserved: U32,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(version: i32) -> Self {
        Self {
            magic: *MAGIC,
            version: U32::new(version as u32),
            flags: U32::new(0),
            write_generation: U64::new(0),
            large_free_head: U32::new(0),
            reserved: U32::new(0),
        }
    }

    /// Parse and validate the fixed header prefix. A bad magic is reported
    /// as [`StoreError::IndexCorruption`] so `Database::open` can rebuild.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(StoreError::IndexCorruption(format!(
                "header too small: {} < {FILE_HEADER_SIZE}",
                bytes.len()
            ))
            .into());
        }

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse file header: {e:?}"))?;

        if &header.magic != MAGIC {
            return Err(
                StoreError::IndexCorruption("invalid magic bytes in header chunk".into()).into(),
            );
        }

        Ok(header)
    }

    pub fn version(&self) -> i32 {
        self.version.get() as i32
    }

    pub fn write_generation(&self) -> u64 {
        self.write_generation.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_fixed() {
        assert_eq!(std::mem::size_of::<FileHeader>(), FILE_HEADER_SIZE);
    }

    #[test]
    fn roundtrip() {
        let header = FileHeader::new(42);
        let parsed = FileHeader::from_bytes(header.as_bytes()).unwrap();
        assert_eq!(parsed.version(), 42);
        assert_eq!(parsed.write_generation(), 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        bytes[..8].copy_from_slice(b"notTagDB");

        let result = FileHeader::from_bytes(&bytes);
        assert!(result.is_err());
        assert!(StoreError::is_corruption(&result.unwrap_err()));
    }

    #[test]
    fn layout_offsets_line_up() {
        // The typed accessors in the store address these fields directly.
        assert_eq!(std::mem::offset_of!(FileHeader, version) as u64, VERSION_OFFSET);
        assert_eq!(
            std::mem::offset_of!(FileHeader, write_generation) as u64,
            WRITE_GENERATION_OFFSET
        );
        assert_eq!(
            std::mem::offset_of!(FileHeader, large_free_head) as u64,
            LARGE_FREE_HEAD_OFFSET
        );
        assert!(ROOT_PTR_SLOTS > 0);
    }
}
