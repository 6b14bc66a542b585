//! # tagdb - Embedded Typed-Record Storage Engine
//!
//! tagdb is a single-process, single-file embedded database for typed,
//! address-addressed records. It was built to hold semantic index data -
//! symbol graphs, reference lists, dependency edges - where the workload is
//! many concurrent readers, one occasional writer, and the whole file is a
//! rebuildable cache of derived data.
//!
//! It is *not* a relational or document database: there is no query
//! language, no secondary indexing, no multi-writer transactions and no
//! network surface. Callers navigate raw record addresses through typed
//! accessors, under a database-wide readers-writer lock.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tagdb::{ChunkCache, Database, TypeRegistry};
//!
//! let cache = Arc::new(ChunkCache::new());     // shared across databases
//! let mut registry = TypeRegistry::new();
//! registry.register(SYMBOL_TAG, Arc::new(SymbolFactory))?;
//!
//! let db = Database::open("index.db", cache, registry, 1..=2, 2)?;
//!
//! let write = db.acquire_write_lock(None)?;
//! let symbol = db.new_record(SYMBOL_TAG)?;
//! Symbol::NAME.put(&db, symbol, "main")?;
//! db.put_root_ptr(0, symbol)?;
//! write.release(0, false)?;
//!
//! let _read = db.acquire_read_lock();
//! let symbol = db.get_node_as::<Symbol>(db.root_ptr(0)?)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            Database (open/clear,             │
//! │     locks, nodes, deletion, memo cache)      │
//! ├──────────┬──────────────┬────────────────────┤
//! │ LockMgr  │ DeletionMgr  │  TypeRegistry      │
//! │ (lock)   │ (delete)     │  (node::registry)  │
//! ├──────────┴──────────────┴────────────────────┤
//! │  Growable Array (array) │ Layout (node::*)   │
//! ├──────────────────────────────────────────────┤
//! │   Allocator: malloc/free, pools (storage)    │
//! ├──────────────────────────────────────────────┤
//! │   ChunkStore: typed access, dirty tracking   │
//! ├──────────────────────────────────────────────┤
//! │   Memory-mapped backing file + shared cache  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## File Format
//!
//! One file, divided into 4 KiB chunks. Chunk 0 holds the header: magic,
//! schema version, the write-generation counter, the allocator's free-list
//! table and a data area of root pointer slots. Every record starts with a
//! 2-byte type tag; pointer fields are 4 bytes, compressed against the
//! allocator's 8-byte block alignment, addressing files up to 32 GiB.
//!
//! ## Concurrency Model
//!
//! Many readers or one writer, arbitrated by [`Database::acquire_read_lock`]
//! / [`Database::acquire_write_lock`]. Writes become visible to readers at
//! write-lock release, which also bumps the persisted write generation,
//! drains deferred deletions, and flushes once enough chunks are dirty.
//! Only write acquisition is cancellable.
//!
//! ## Error Handling
//!
//! All fallible operations return [`eyre::Result`]. The conditions callers
//! are expected to distinguish (corruption, type mismatch, lock misuse,
//! argument errors, cancellation) travel as a typed [`StoreError`] inside
//! the report. A corrupt or version-incompatible file never surfaces at
//! `open`: it is discarded and rebuilt empty.

pub mod array;
pub mod config;
pub mod database;
pub mod delete;
pub mod error;
pub mod lock;
pub mod node;
pub mod storage;

pub use array::GrowableArrayDef;
pub use database::{Database, ReadLock, WriteLock, WriteLockFailure};
pub use error::StoreError;
pub use lock::CancelProbe;
pub use node::{
    DeletionSemantics, FieldArray, FieldByte, FieldInt, FieldLong, FieldPointer, FieldShort,
    FieldString, NodeHandle, NodeType, StructBuilder, TypeFactory, TypeRegistry, TypedNode,
};
pub use storage::{Address, ChunkCache, ChunkStats, ChunkStore, PoolStats};
