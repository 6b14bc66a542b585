//! # Type Registry
//!
//! A record's first two bytes are its type tag. The registry maps each tag
//! to the strategy object that knows how big records of that type are, how
//! to tear one down, and whether a scheduled deletion may proceed.
//!
//! The registry is built up-front by the caller and handed to
//! `Database::open`; registration is not possible on a live database, which
//! keeps dispatch lock-free.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;

use crate::config::POOL_FIRST_NODE_TYPE;
use crate::database::Database;
use crate::error::StoreError;
use crate::storage::Address;

/// How records of a type leave the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionSemantics {
    /// The owner deletes the record explicitly.
    Explicit,
    /// The record is dropped once nothing references it; its factory's
    /// `is_ready_for_deletion` consults the reference state.
    Refcounted,
}

/// Per-type strategy. Implementations are registered once per tag.
///
/// `destruct` must only tear down state the record owns directly - string
/// fields, growable-array blocks - never the records its pointers refer to;
/// those belong to their own owners.
pub trait TypeFactory: Send + Sync {
    /// Name used in diagnostics and `TypeMismatch` errors.
    fn type_name(&self) -> &'static str;

    /// On-disk size of a record of this type, including the 2-byte tag.
    fn record_size(&self) -> u64;

    fn deletion_semantics(&self) -> DeletionSemantics {
        DeletionSemantics::Explicit
    }

    /// Probed by deferred deletion; a record that is not ready is skipped.
    fn is_ready_for_deletion(&self, _db: &Database, _address: Address) -> Result<bool> {
        Ok(true)
    }

    /// Tear down owned field state (strings, arrays). Called by `destruct`.
    fn destruct_fields(&self, _db: &Database, _address: Address) -> Result<()> {
        Ok(())
    }

    /// Full teardown before the record's memory is freed.
    fn destruct(&self, db: &Database, address: Address) -> Result<()> {
        self.destruct_fields(db, address)
    }
}

impl std::fmt::Debug for dyn TypeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeFactory")
            .field("type_name", &self.type_name())
            .finish()
    }
}

pub struct TypeRegistry {
    factories: HashMap<u16, Arc<dyn TypeFactory>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory for `tag`. Tag 0 is reserved (it is what freed
    /// memory reads back as); duplicate registration is an error.
    pub fn register(&mut self, tag: u16, factory: Arc<dyn TypeFactory>) -> Result<()> {
        if tag == 0 {
            return Err(
                StoreError::IllegalArgument("type tag 0 is reserved for free space".into()).into(),
            );
        }
        if self.factories.contains_key(&tag) {
            return Err(StoreError::IllegalArgument(format!(
                "type tag {tag:#06x} is already registered"
            ))
            .into());
        }
        self.factories.insert(tag, factory);
        Ok(())
    }

    /// Look up the factory for a tag read back from disk. An unknown tag
    /// means the file does not match the registered schema.
    pub fn factory(&self, tag: u16) -> Result<&Arc<dyn TypeFactory>> {
        self.factories.get(&tag).ok_or_else(|| {
            StoreError::IndexCorruption(format!("unknown type tag {tag:#06x}")).into()
        })
    }

    pub fn contains(&self, tag: u16) -> bool {
        self.factories.contains_key(&tag)
    }

    /// Allocation pool for records of `tag`.
    pub fn pool_for(tag: u16) -> u16 {
        POOL_FIRST_NODE_TYPE.wrapping_add(tag)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
