//! # Storage Module
//!
//! The foundational storage layer: a single backing file divided into
//! fixed-size chunks, memory-mapped for zero-copy access, with a
//! malloc/free allocator layered directly on the byte arena.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Allocator (alloc): malloc/free,       │
//! │   size-class free lists, large runs     │
//! ├─────────────────────────────────────────┤
//! │   ChunkStore (store): typed accessors,  │
//! │   pointer compression, dirty tracking,  │
//! │   header fields, flush                  │
//! ├──────────────────────┬──────────────────┤
//! │  MmapFile (file)     │ ChunkCache       │
//! │  mmap + grow/remap   │ (cache, shared   │
//! │                      │  across DBs)     │
//! └──────────────────────┴──────────────────┘
//! ```
//!
//! Chunk 0 is the header chunk (`header`): magic, schema version, write
//! generation, the allocator's free-list table and the root-pointer data
//! area.
//!
//! ## Consistency Model
//!
//! Mutations require the engine's exclusive mode (toggled by the lock
//! manager around the write lock); reads require only a read lock. Dirty
//! chunks are tracked in the shared [`ChunkCache`] and persisted by
//! [`ChunkStore::flush`], which the write-lock release path invokes when the
//! dirty ratio crosses the configured threshold.

mod alloc;
mod cache;
mod file;
mod header;
mod store;

pub use alloc::PoolStats;
pub use cache::ChunkCache;
pub use header::ROOT_PTR_SLOTS;
pub use store::{Address, ChunkStats, ChunkStore};
