//! # Growable Array
//!
//! An embedded, variable-length list of non-zero record pointers. The array
//! header lives inside its parent record; element storage moves through
//! three tiers as the array grows:
//!
//! ```text
//! header:     [ block ptr ][ inline slot 0 ] ... [ inline slot N-1 ]
//!
//! inline:     block ptr == 0; all elements in the inline slots; size is
//!             derived by scanning for the first zero slot.
//!
//! block:      elements 0..N stay inline, overflow lives in one growable
//!             block: [ size:i32 ][ capacity:i32 ][ slots ... ]
//!             capacity is a power of two, floored at the inline size and
//!             clamped at MAX_BLOCK_SIZE slots; size (stored, total) is
//!             authoritative.
//!
//! metablock:  the block ptr targets a metablock with the same header whose
//!             slots are pointers to uniformly max-sized raw leaf blocks;
//!             its capacity is a multiple of MAX_BLOCK_SIZE and the record
//!             itself is allocated at chunk-aligned sizes.
//! ```
//!
//! Zero is the universal absent sentinel and never a valid element, which is
//! what makes the inline-scan size derivation work. Removal swaps the last
//! element into the vacated slot, so order is preserved only until the first
//! removal; the vacated tail slot is always zeroed.
//!
//! Shrinking is driven by `repack_if_necessary` with deliberate hysteresis
//! (growth doubles, shrink waits for quarter occupancy; metablocks keep one
//! spare leaf) so alternating add/remove around a boundary cannot thrash the
//! allocator. Shrink targets reuse the growth computation, so capacity after
//! a shrink never exceeds what a fresh build at that size would allocate.
//!
//! Destroying an array frees its own blocks only. The records its elements
//! point to belong to a higher-level owner.

use eyre::Result;

use crate::config::{
    CHUNK_SIZE, GROWABLE_BLOCK_HEADER_BYTES, INT_SIZE, MAX_BLOCK_SIZE, METABLOCK_FREE_BLOCK_SLACK,
    METABLOCK_TAIL_SLACK, POOL_GROWABLE_ARRAY, PTR_SIZE, SINGLE_BLOCK_SHRINK_DIVISOR,
};
use crate::database::Database;
use crate::error::StoreError;
use crate::storage::{Address, ChunkStore};

/// Header share of the embedded array: the block pointer.
pub const ARRAY_HEADER_BYTES: u64 = PTR_SIZE;

const BLOCK_SIZE_OFFSET: u64 = 0;
const BLOCK_CAPACITY_OFFSET: u64 = INT_SIZE;

/// Describes one kind of growable array: the inline slot count is declared
/// by the owning record type and fixes the header's record share. The def
/// itself is a plain value - all state lives in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowableArrayDef {
    inline_size: u32,
}

impl GrowableArrayDef {
    /// `inline_size` may be zero (everything spills to blocks immediately)
    /// and may not exceed [`MAX_BLOCK_SIZE`].
    pub const fn new(inline_size: u32) -> Self {
        assert!(inline_size as usize <= MAX_BLOCK_SIZE);
        Self { inline_size }
    }

    pub const fn inline_size(&self) -> u32 {
        self.inline_size
    }

    /// Bytes this array contributes to its owner's record size.
    pub const fn record_size(&self) -> u64 {
        ARRAY_HEADER_BYTES + PTR_SIZE * self.inline_size as u64
    }

    // ------------------------------------------------------------------
    // public surface (database-level)
    // ------------------------------------------------------------------

    pub fn size(&self, db: &Database, addr: Address) -> Result<u32> {
        self.size_in(db.store(), addr)
    }

    pub fn is_empty(&self, db: &Database, addr: Address) -> Result<bool> {
        self.is_empty_in(db.store(), addr)
    }

    pub fn add(&self, db: &Database, addr: Address, value: Address) -> Result<u32> {
        self.add_in(db.store(), addr, value)
    }

    pub fn get(&self, db: &Database, addr: Address, index: u32) -> Result<Address> {
        self.get_in(db.store(), addr, index)
    }

    pub fn remove(&self, db: &Database, addr: Address, index: u32) -> Result<Address> {
        self.remove_in(db.store(), addr, index)
    }

    pub fn ensure_capacity(&self, db: &Database, addr: Address, desired: u32) -> Result<()> {
        self.ensure_capacity_in(db.store(), addr, desired)
    }

    pub fn capacity(&self, db: &Database, addr: Address) -> Result<u32> {
        self.capacity_in(db.store(), addr)
    }

    /// Repack to zero capacity: free every block this array owns.
    pub fn destruct(&self, db: &Database, addr: Address) -> Result<()> {
        self.destruct_in(db.store(), addr)
    }

    // ------------------------------------------------------------------
    // implementation (store-level)
    // ------------------------------------------------------------------

    fn inline_slot(&self, addr: Address, index: u32) -> Address {
        addr + ARRAY_HEADER_BYTES + index as u64 * PTR_SIZE
    }

    fn block_slot(block: Address, index: u32) -> Address {
        block + GROWABLE_BLOCK_HEADER_BYTES + index as u64 * PTR_SIZE
    }

    fn block_ptr(&self, store: &ChunkStore, addr: Address) -> Result<Address> {
        store.get_rec_ptr(addr)
    }

    fn stored_size(store: &ChunkStore, block: Address) -> Result<u32> {
        Ok(store.get_int(block + BLOCK_SIZE_OFFSET)? as u32)
    }

    fn stored_capacity(store: &ChunkStore, block: Address) -> Result<u32> {
        Ok(store.get_int(block + BLOCK_CAPACITY_OFFSET)? as u32)
    }

    pub(crate) fn size_in(&self, store: &ChunkStore, addr: Address) -> Result<u32> {
        let block = self.block_ptr(store, addr)?;
        if block != 0 {
            return Self::stored_size(store, block);
        }
        for i in 0..self.inline_size {
            if store.get_rec_ptr(self.inline_slot(addr, i))? == 0 {
                return Ok(i);
            }
        }
        Ok(self.inline_size)
    }

    pub(crate) fn is_empty_in(&self, store: &ChunkStore, addr: Address) -> Result<bool> {
        let block = self.block_ptr(store, addr)?;
        if block != 0 {
            return Ok(Self::stored_size(store, block)? == 0);
        }
        if self.inline_size == 0 {
            return Ok(true);
        }
        Ok(store.get_rec_ptr(self.inline_slot(addr, 0))? == 0)
    }

    pub(crate) fn capacity_in(&self, store: &ChunkStore, addr: Address) -> Result<u32> {
        let block = self.block_ptr(store, addr)?;
        if block == 0 {
            return Ok(self.inline_size);
        }
        Ok(self.inline_size + Self::stored_capacity(store, block)?)
    }

    /// Address of the slot holding element `index`, resolving through the
    /// current tier.
    fn element_slot(&self, store: &ChunkStore, addr: Address, index: u32) -> Result<Address> {
        if index < self.inline_size {
            return Ok(self.inline_slot(addr, index));
        }
        let block = self.block_ptr(store, addr)?;
        if block == 0 {
            return Err(StoreError::IndexCorruption(format!(
                "array at {addr:#x} has no block but element {index} was addressed"
            ))
            .into());
        }
        let rel = index - self.inline_size;
        let capacity = Self::stored_capacity(store, block)?;
        if capacity as usize <= MAX_BLOCK_SIZE {
            return Ok(Self::block_slot(block, rel));
        }
        let leaf_index = rel / MAX_BLOCK_SIZE as u32;
        let leaf = store.get_rec_ptr(Self::block_slot(block, leaf_index))?;
        if leaf == 0 {
            return Err(StoreError::IndexCorruption(format!(
                "metablock at {block:#x} is missing leaf {leaf_index}"
            ))
            .into());
        }
        Ok(leaf + (rel % MAX_BLOCK_SIZE as u32) as u64 * PTR_SIZE)
    }

    pub(crate) fn get_in(&self, store: &ChunkStore, addr: Address, index: u32) -> Result<Address> {
        let size = self.size_in(store, addr)?;
        if index >= size {
            return Err(StoreError::IllegalArgument(format!(
                "index {index} out of range (size {size})"
            ))
            .into());
        }
        store.get_rec_ptr(self.element_slot(store, addr, index)?)
    }

    pub(crate) fn add_in(&self, store: &ChunkStore, addr: Address, value: Address) -> Result<u32> {
        if value == 0 {
            return Err(StoreError::IllegalArgument(
                "cannot store 0 in a growable array".into(),
            )
            .into());
        }

        let index = self.size_in(store, addr)?;
        self.ensure_capacity_in(store, addr, index + 1)?;

        store.put_rec_ptr(self.element_slot(store, addr, index)?, value)?;

        let block = self.block_ptr(store, addr)?;
        if block != 0 {
            store.put_int(block + BLOCK_SIZE_OFFSET, (index + 1) as i32)?;
        }
        Ok(index)
    }

    pub(crate) fn remove_in(
        &self,
        store: &ChunkStore,
        addr: Address,
        index: u32,
    ) -> Result<Address> {
        let size = self.size_in(store, addr)?;
        if index >= size {
            return Err(StoreError::IllegalArgument(format!(
                "cannot remove index {index} (size {size})"
            ))
            .into());
        }

        let last = size - 1;
        let last_slot = self.element_slot(store, addr, last)?;
        let moved = if index != last {
            let moved = store.get_rec_ptr(last_slot)?;
            store.put_rec_ptr(self.element_slot(store, addr, index)?, moved)?;
            moved
        } else {
            0
        };
        store.put_rec_ptr(last_slot, 0)?;

        let block = self.block_ptr(store, addr)?;
        if block != 0 {
            store.put_int(block + BLOCK_SIZE_OFFSET, last as i32)?;
            self.repack_if_necessary(store, addr)?;
        }
        Ok(moved)
    }

    /// Power-of-two growth target for a single block holding
    /// `needed_overflow` elements: floored at the inline size, clamped at
    /// [`MAX_BLOCK_SIZE`]. Shrinking reuses this, which is what keeps
    /// capacity after a shrink no larger than a fresh build would produce.
    fn preferred_block_capacity(&self, needed_overflow: u32) -> u32 {
        let floor = self.inline_size.max(1).next_power_of_two();
        needed_overflow
            .next_power_of_two()
            .max(floor)
            .min(MAX_BLOCK_SIZE as u32)
    }

    /// Chunk-aligned byte size of a metablock record holding `blocks` leaf
    /// pointers.
    fn metablock_bytes(blocks: u32) -> u64 {
        let payload = GROWABLE_BLOCK_HEADER_BYTES + blocks as u64 * PTR_SIZE;
        payload.div_ceil(CHUNK_SIZE as u64) * CHUNK_SIZE as u64
    }

    fn needed_blocks(overflow: u32) -> u32 {
        (overflow as u64).div_ceil(MAX_BLOCK_SIZE as u64) as u32
    }

    pub(crate) fn ensure_capacity_in(
        &self,
        store: &ChunkStore,
        addr: Address,
        desired: u32,
    ) -> Result<()> {
        let current = self.capacity_in(store, addr)?;
        if desired <= current {
            return Ok(());
        }

        let size = self.size_in(store, addr)?;
        let needed_overflow = desired - self.inline_size;

        if needed_overflow as usize <= MAX_BLOCK_SIZE {
            let new_capacity = self.preferred_block_capacity(needed_overflow);
            self.resize_single_block(store, addr, size, new_capacity)?;
        } else {
            self.grow_to_metablock(store, addr, size, Self::needed_blocks(needed_overflow))?;
        }
        Ok(())
    }

    /// Replace the current single block (if any) with one of `new_capacity`
    /// slots, carrying the overflow elements over.
    fn resize_single_block(
        &self,
        store: &ChunkStore,
        addr: Address,
        size: u32,
        new_capacity: u32,
    ) -> Result<()> {
        let old_block = self.block_ptr(store, addr)?;
        let new_block = store.malloc(
            GROWABLE_BLOCK_HEADER_BYTES + new_capacity as u64 * PTR_SIZE,
            POOL_GROWABLE_ARRAY,
        )?;
        store.put_int(new_block + BLOCK_SIZE_OFFSET, size as i32)?;
        store.put_int(new_block + BLOCK_CAPACITY_OFFSET, new_capacity as i32)?;

        let overflow = size.saturating_sub(self.inline_size);
        if old_block != 0 && overflow > 0 {
            store.memcpy(
                Self::block_slot(new_block, 0),
                Self::block_slot(old_block, 0),
                overflow as u64 * PTR_SIZE,
            )?;
        }
        if old_block != 0 {
            store.free(old_block, POOL_GROWABLE_ARRAY)?;
        }
        store.put_rec_ptr(addr, new_block)
    }

    fn alloc_leaf(store: &ChunkStore) -> Result<Address> {
        store.malloc(MAX_BLOCK_SIZE as u64 * PTR_SIZE, POOL_GROWABLE_ARRAY)
    }

    /// Convert to (or extend) a metablock with `needed_blocks` leaves.
    fn grow_to_metablock(
        &self,
        store: &ChunkStore,
        addr: Address,
        size: u32,
        needed_blocks: u32,
    ) -> Result<()> {
        let old_block = self.block_ptr(store, addr)?;
        let old_capacity = if old_block != 0 {
            Self::stored_capacity(store, old_block)?
        } else {
            0
        };

        let (meta, existing_blocks) = if old_capacity as usize > MAX_BLOCK_SIZE {
            // Already a metablock; grow the pointer record if its
            // chunk-aligned size no longer suffices.
            let current_blocks = old_capacity / MAX_BLOCK_SIZE as u32;
            if Self::metablock_bytes(needed_blocks) > Self::metablock_bytes(current_blocks) {
                let new_meta =
                    store.malloc(Self::metablock_bytes(needed_blocks), POOL_GROWABLE_ARRAY)?;
                store.put_int(new_meta + BLOCK_SIZE_OFFSET, size as i32)?;
                store.memcpy(
                    Self::block_slot(new_meta, 0),
                    Self::block_slot(old_block, 0),
                    current_blocks as u64 * PTR_SIZE,
                )?;
                store.free(old_block, POOL_GROWABLE_ARRAY)?;
                store.put_rec_ptr(addr, new_meta)?;
                (new_meta, current_blocks)
            } else {
                (old_block, current_blocks)
            }
        } else {
            // Single block (or nothing): normalize the overflow into a
            // max-size leaf, then hang it off a fresh metablock.
            let leaf0 = Self::alloc_leaf(store)?;
            let overflow = size.saturating_sub(self.inline_size);
            if old_block != 0 {
                if overflow > 0 {
                    store.memcpy(leaf0, Self::block_slot(old_block, 0), overflow as u64 * PTR_SIZE)?;
                }
                store.free(old_block, POOL_GROWABLE_ARRAY)?;
            }
            let meta = store.malloc(Self::metablock_bytes(needed_blocks), POOL_GROWABLE_ARRAY)?;
            store.put_int(meta + BLOCK_SIZE_OFFSET, size as i32)?;
            store.put_rec_ptr(Self::block_slot(meta, 0), leaf0)?;
            store.put_rec_ptr(addr, meta)?;
            (meta, 1)
        };

        for i in existing_blocks..needed_blocks {
            let leaf = Self::alloc_leaf(store)?;
            store.put_rec_ptr(Self::block_slot(meta, i), leaf)?;
        }
        store.put_int(
            meta + BLOCK_CAPACITY_OFFSET,
            (needed_blocks * MAX_BLOCK_SIZE as u32) as i32,
        )?;
        Ok(())
    }

    /// Shrink storage once occupancy has fallen far enough below capacity.
    fn repack_if_necessary(&self, store: &ChunkStore, addr: Address) -> Result<()> {
        let block = self.block_ptr(store, addr)?;
        if block == 0 {
            return Ok(());
        }
        let size = Self::stored_size(store, block)?;
        let capacity = Self::stored_capacity(store, block)?;
        let overflow = size.saturating_sub(self.inline_size);

        if capacity as usize > MAX_BLOCK_SIZE {
            let current_blocks = capacity / MAX_BLOCK_SIZE as u32;

            if overflow as usize <= MAX_BLOCK_SIZE {
                return self.collapse_metablock(store, addr, block, size, overflow, current_blocks);
            }

            let needed_blocks = Self::needed_blocks(overflow);
            let excess = current_blocks - needed_blocks;
            let tail_used = overflow - (needed_blocks - 1) * MAX_BLOCK_SIZE as u32;
            let tail_slack = (MAX_BLOCK_SIZE / 2 + METABLOCK_TAIL_SLACK) as u32;
            if excess > METABLOCK_FREE_BLOCK_SLACK as u32 || (excess >= 1 && tail_used <= tail_slack)
            {
                self.shrink_metablock(store, addr, block, size, current_blocks, needed_blocks)?;
            }
            return Ok(());
        }

        if overflow == 0 {
            store.free(block, POOL_GROWABLE_ARRAY)?;
            return store.put_rec_ptr(addr, 0);
        }
        if overflow <= capacity / SINGLE_BLOCK_SHRINK_DIVISOR as u32 {
            let target = self.preferred_block_capacity(overflow);
            if target < capacity {
                self.resize_single_block(store, addr, size, target)?;
            }
        }
        Ok(())
    }

    fn free_leaves(
        store: &ChunkStore,
        meta: Address,
        from: u32,
        to: u32,
    ) -> Result<()> {
        for i in from..to {
            let slot = Self::block_slot(meta, i);
            let leaf = store.get_rec_ptr(slot)?;
            if leaf != 0 {
                store.free(leaf, POOL_GROWABLE_ARRAY)?;
                store.put_rec_ptr(slot, 0)?;
            }
        }
        Ok(())
    }

    /// Drop trailing leaves down to `needed_blocks`, shrinking the pointer
    /// record itself when its chunk-aligned size goes down.
    fn shrink_metablock(
        &self,
        store: &ChunkStore,
        addr: Address,
        meta: Address,
        size: u32,
        current_blocks: u32,
        needed_blocks: u32,
    ) -> Result<()> {
        Self::free_leaves(store, meta, needed_blocks, current_blocks)?;

        let meta = if Self::metablock_bytes(needed_blocks) < Self::metablock_bytes(current_blocks) {
            let new_meta = store.malloc(Self::metablock_bytes(needed_blocks), POOL_GROWABLE_ARRAY)?;
            store.put_int(new_meta + BLOCK_SIZE_OFFSET, size as i32)?;
            store.memcpy(
                Self::block_slot(new_meta, 0),
                Self::block_slot(meta, 0),
                needed_blocks as u64 * PTR_SIZE,
            )?;
            store.free(meta, POOL_GROWABLE_ARRAY)?;
            store.put_rec_ptr(addr, new_meta)?;
            new_meta
        } else {
            meta
        };

        store.put_int(
            meta + BLOCK_CAPACITY_OFFSET,
            (needed_blocks * MAX_BLOCK_SIZE as u32) as i32,
        )
    }

    /// The whole overflow fits one leaf again: fold back to a single block
    /// (or to pure inline storage when there is no overflow at all).
    fn collapse_metablock(
        &self,
        store: &ChunkStore,
        addr: Address,
        meta: Address,
        size: u32,
        overflow: u32,
        current_blocks: u32,
    ) -> Result<()> {
        if overflow == 0 {
            Self::free_leaves(store, meta, 0, current_blocks)?;
            store.free(meta, POOL_GROWABLE_ARRAY)?;
            return store.put_rec_ptr(addr, 0);
        }

        let capacity = self.preferred_block_capacity(overflow);
        let new_block = store.malloc(
            GROWABLE_BLOCK_HEADER_BYTES + capacity as u64 * PTR_SIZE,
            POOL_GROWABLE_ARRAY,
        )?;
        store.put_int(new_block + BLOCK_SIZE_OFFSET, size as i32)?;
        store.put_int(new_block + BLOCK_CAPACITY_OFFSET, capacity as i32)?;

        let leaf0 = store.get_rec_ptr(Self::block_slot(meta, 0))?;
        if leaf0 == 0 {
            return Err(StoreError::IndexCorruption(format!(
                "metablock at {meta:#x} is missing leaf 0"
            ))
            .into());
        }
        store.memcpy(Self::block_slot(new_block, 0), leaf0, overflow as u64 * PTR_SIZE)?;

        Self::free_leaves(store, meta, 0, current_blocks)?;
        store.free(meta, POOL_GROWABLE_ARRAY)?;
        store.put_rec_ptr(addr, new_block)
    }

    pub(crate) fn destruct_in(&self, store: &ChunkStore, addr: Address) -> Result<()> {
        let block = self.block_ptr(store, addr)?;
        if block == 0 {
            return Ok(());
        }
        let capacity = Self::stored_capacity(store, block)?;
        if capacity as usize > MAX_BLOCK_SIZE {
            Self::free_leaves(store, block, 0, capacity / MAX_BLOCK_SIZE as u32)?;
        }
        store.free(block, POOL_GROWABLE_ARRAY)?;
        store.put_rec_ptr(addr, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::POOL_MISC;
    use crate::storage::ChunkCache;
    use std::sync::Arc;
    use tempfile::tempdir;

    const DEF: GrowableArrayDef = GrowableArrayDef::new(2);

    fn store_with_array(def: &GrowableArrayDef) -> (tempfile::TempDir, ChunkStore, Address) {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ChunkCache::new());
        let store = ChunkStore::create(dir.path().join("array.db"), cache, 1).unwrap();
        store.set_exclusive(true);
        let addr = store.malloc(def.record_size(), POOL_MISC).unwrap();
        (dir, store, addr)
    }

    /// Synthetic but well-formed record pointer for slot `i`.
    fn value(i: u64) -> Address {
        CHUNK_SIZE as u64 + i * 8 + 2
    }

    #[test]
    fn swap_remove_scenario() {
        let (_dir, store, addr) = store_with_array(&DEF);
        let (a, b, c) = (value(1), value(2), value(3));

        assert_eq!(DEF.add_in(&store, addr, a).unwrap(), 0);
        assert_eq!(DEF.add_in(&store, addr, b).unwrap(), 1);
        // Third add forces the first growable block; capacity doubles.
        assert_eq!(DEF.add_in(&store, addr, c).unwrap(), 2);
        assert_eq!(DEF.size_in(&store, addr).unwrap(), 3);
        assert_eq!(DEF.capacity_in(&store, addr).unwrap(), 4);

        let moved = DEF.remove_in(&store, addr, 0).unwrap();
        assert_eq!(moved, c);
        assert_eq!(DEF.size_in(&store, addr).unwrap(), 2);
        assert_eq!(DEF.get_in(&store, addr, 0).unwrap(), c);
        assert_eq!(DEF.get_in(&store, addr, 1).unwrap(), b);
    }

    #[test]
    fn remove_last_returns_zero() {
        let (_dir, store, addr) = store_with_array(&DEF);
        DEF.add_in(&store, addr, value(1)).unwrap();
        DEF.add_in(&store, addr, value(2)).unwrap();

        assert_eq!(DEF.remove_in(&store, addr, 1).unwrap(), 0);
        assert_eq!(DEF.size_in(&store, addr).unwrap(), 1);
        assert_eq!(DEF.get_in(&store, addr, 0).unwrap(), value(1));
    }

    #[test]
    fn zero_value_rejected() {
        let (_dir, store, addr) = store_with_array(&DEF);
        let err = DEF.add_in(&store, addr, 0).unwrap_err();
        assert!(StoreError::is_illegal_argument(&err));
    }

    #[test]
    fn get_out_of_range_rejected() {
        let (_dir, store, addr) = store_with_array(&DEF);
        DEF.add_in(&store, addr, value(1)).unwrap();

        let err = DEF.get_in(&store, addr, 1).unwrap_err();
        assert!(StoreError::is_illegal_argument(&err));
        let err = DEF.remove_in(&store, addr, 5).unwrap_err();
        assert!(StoreError::is_illegal_argument(&err));
    }

    #[test]
    fn inline_size_derivation() {
        let (_dir, store, addr) = store_with_array(&DEF);
        assert_eq!(DEF.size_in(&store, addr).unwrap(), 0);
        assert!(DEF.is_empty_in(&store, addr).unwrap());

        DEF.add_in(&store, addr, value(1)).unwrap();
        assert_eq!(DEF.size_in(&store, addr).unwrap(), 1);
        assert!(!DEF.is_empty_in(&store, addr).unwrap());

        DEF.add_in(&store, addr, value(2)).unwrap();
        assert_eq!(DEF.size_in(&store, addr).unwrap(), 2);
        assert_eq!(DEF.capacity_in(&store, addr).unwrap(), 2);
    }

    #[test]
    fn grows_into_metablock_and_back() {
        let (_dir, store, addr) = store_with_array(&DEF);
        let count = 2 + 3 * MAX_BLOCK_SIZE as u32; // deep into metablock territory

        for i in 0..count {
            DEF.add_in(&store, addr, value(i as u64 + 1)).unwrap();
        }
        assert_eq!(DEF.size_in(&store, addr).unwrap(), count);
        assert!(DEF.capacity_in(&store, addr).unwrap() >= count);

        // Every element is still addressable.
        assert_eq!(DEF.get_in(&store, addr, 0).unwrap(), value(1));
        assert_eq!(
            DEF.get_in(&store, addr, count - 1).unwrap(),
            value(count as u64)
        );

        // Shrink all the way down; capacity must never exceed what a fresh
        // build at the final size would allocate.
        for _ in 0..(count - 1) {
            let size = DEF.size_in(&store, addr).unwrap();
            DEF.remove_in(&store, addr, size - 1).unwrap();
        }
        assert_eq!(DEF.size_in(&store, addr).unwrap(), 1);
        let final_capacity = DEF.capacity_in(&store, addr).unwrap();
        assert!(
            final_capacity <= DEF.inline_size() + DEF.preferred_block_capacity(1),
            "capacity {final_capacity} exceeds fresh computation"
        );
    }

    #[test]
    fn shrink_back_to_inline_frees_block() {
        let (_dir, store, addr) = store_with_array(&DEF);
        for i in 0..5 {
            DEF.add_in(&store, addr, value(i + 1)).unwrap();
        }
        // A block exists now.
        assert_ne!(store.get_rec_ptr(addr).unwrap(), 0);

        for _ in 0..4 {
            let size = DEF.size_in(&store, addr).unwrap();
            DEF.remove_in(&store, addr, size - 1).unwrap();
        }
        // Overflow reached zero: back to pure inline storage.
        assert_eq!(store.get_rec_ptr(addr).unwrap(), 0);
        assert_eq!(DEF.size_in(&store, addr).unwrap(), 1);
        assert_eq!(DEF.get_in(&store, addr, 0).unwrap(), value(1));
    }

    #[test]
    fn ensure_capacity_is_monotonic_and_idempotent() {
        let (_dir, store, addr) = store_with_array(&DEF);

        DEF.ensure_capacity_in(&store, addr, 100).unwrap();
        let cap = DEF.capacity_in(&store, addr).unwrap();
        assert!(cap >= 100);

        DEF.ensure_capacity_in(&store, addr, 10).unwrap();
        assert_eq!(DEF.capacity_in(&store, addr).unwrap(), cap);

        DEF.ensure_capacity_in(&store, addr, cap).unwrap();
        assert_eq!(DEF.capacity_in(&store, addr).unwrap(), cap);
    }

    #[test]
    fn destruct_releases_all_storage() {
        let (_dir, store, addr) = store_with_array(&DEF);
        let count = 2 + 2 * MAX_BLOCK_SIZE as u32;
        for i in 0..count {
            DEF.add_in(&store, addr, value(i as u64 + 1)).unwrap();
        }

        DEF.destruct_in(&store, addr).unwrap();
        assert_eq!(store.get_rec_ptr(addr).unwrap(), 0);

        let stats = store.memory_stats();
        let growable = stats
            .iter()
            .find(|(pool, _)| *pool == POOL_GROWABLE_ARRAY)
            .map(|(_, s)| *s)
            .unwrap();
        assert_eq!(growable.live_bytes, 0);
    }

    #[test]
    fn zero_inline_arrays_spill_immediately() {
        let def = GrowableArrayDef::new(0);
        let (_dir, store, addr) = store_with_array(&def);

        assert_eq!(def.size_in(&store, addr).unwrap(), 0);
        def.add_in(&store, addr, value(9)).unwrap();
        assert_eq!(def.size_in(&store, addr).unwrap(), 1);
        assert_eq!(def.get_in(&store, addr, 0).unwrap(), value(9));
        assert_ne!(store.get_rec_ptr(addr).unwrap(), 0);

        def.remove_in(&store, addr, 0).unwrap();
        assert_eq!(def.size_in(&store, addr).unwrap(), 0);
        assert_eq!(store.get_rec_ptr(addr).unwrap(), 0);
    }
}
