//! # Engine Constants
//!
//! All configuration constants, grouped by functional area. Constants that
//! depend on each other are co-located and the relationships are enforced by
//! compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! CHUNK_SIZE (4096 bytes)
//!       │
//!       ├─> MAX_BLOCK_DELTAS (derived: usable chunk space / BLOCK_SIZE_DELTA)
//!       │
//!       ├─> MALLOC_TABLE_ENTRIES (one free-list head per small size class)
//!       │     The whole table must fit in the header chunk together with
//!       │     the fixed header and the root-pointer data area.
//!       │
//!       └─> METABLOCK leaf sizing (metablock records are chunk-aligned)
//!
//! BLOCK_SIZE_DELTA (8 bytes)
//!       │
//!       ├─> BLOCK_SIZE_DELTA_BITS (log2, used for pointer compression)
//!       │     Record pointers are stored in 4 bytes as
//!       │     (address - BLOCK_HEADER_SIZE) >> BLOCK_SIZE_DELTA_BITS,
//!       │     which is what makes MAX_DB_SIZE = 2^(32+3) bytes reachable.
//!       │
//!       └─> MIN_BLOCK_DELTAS (smallest block that can hold a free-block
//!           header: 2-byte size + two 4-byte list links)
//!
//! MAX_BLOCK_SIZE (512 array slots)
//!       │
//!       └─> A max-size growable block (8-byte header + 512 * PTR_SIZE)
//!           must fit in a single small malloc; leaves in metablock mode
//!           are raw slot arrays of exactly MAX_BLOCK_SIZE slots.
//! ```
//!
//! ## Modifying Constants
//!
//! Before changing any constant check the dependency graph above; the
//! compile-time assertions at the bottom of this file will catch layout
//! violations, but not every semantic mismatch.

/// Size of a chunk, the atomic unit of paging, dirty tracking and flushing.
pub const CHUNK_SIZE: usize = 4096;

/// Mask for the offset of an address within its chunk.
pub const OFFSET_IN_CHUNK_MASK: u64 = CHUNK_SIZE as u64 - 1;

/// Every allocated block is preceded by a 2-byte signed size header.
/// Negative means in use, positive means free, zero marks a large block.
pub const BLOCK_HEADER_SIZE: u64 = 2;

/// log2 of [`BLOCK_SIZE_DELTA`]; also the compression shift for record
/// pointers.
pub const BLOCK_SIZE_DELTA_BITS: u32 = 3;

/// Small-block sizes are multiples of this granule.
pub const BLOCK_SIZE_DELTA: usize = 1 << BLOCK_SIZE_DELTA_BITS;

/// A free small block stores its list links after the size header:
/// prev (4 bytes) and next (4 bytes).
pub const FREE_BLOCK_HEADER_SIZE: usize = BLOCK_HEADER_SIZE as usize + 2 * PTR_SIZE as usize;

/// Smallest small-block size, in deltas. Must fit the free-block header.
pub const MIN_BLOCK_DELTAS: usize =
    (FREE_BLOCK_HEADER_SIZE + BLOCK_SIZE_DELTA - 1) / BLOCK_SIZE_DELTA;

/// In-use large blocks and the chunk runs carved up for small blocks carry
/// a 16-byte header (chunk count + free-list links + padding to keep the
/// interior 8-aligned) and a 4-byte footer replicating the chunk count.
pub const LARGE_BLOCK_HEADER_SIZE: usize = 16;
pub const LARGE_BLOCK_FOOTER_SIZE: usize = 4;

/// Largest small-block size, in deltas: what is left of a chunk after the
/// large-block header and footer.
pub const MAX_BLOCK_DELTAS: usize =
    (CHUNK_SIZE - LARGE_BLOCK_HEADER_SIZE - LARGE_BLOCK_FOOTER_SIZE) / BLOCK_SIZE_DELTA;

/// Largest payload malloc will serve from a single small block. Anything
/// bigger becomes a large block spanning whole chunks.
pub const MAX_SINGLE_BLOCK_MALLOC_SIZE: usize =
    MAX_BLOCK_DELTAS * BLOCK_SIZE_DELTA - BLOCK_HEADER_SIZE as usize;

/// Stored size of a pointer field. Pointers are compressed by
/// [`BLOCK_SIZE_DELTA_BITS`], so 4 bytes address up to [`MAX_DB_SIZE`].
pub const PTR_SIZE: u64 = 4;

/// Maximum addressable file size under the compressed-pointer scheme.
pub const MAX_DB_SIZE: u64 = 1 << (32 + BLOCK_SIZE_DELTA_BITS);

pub const BYTE_SIZE: u64 = 1;
pub const SHORT_SIZE: u64 = 2;
pub const INT_SIZE: u64 = 4;
pub const LONG_SIZE: u64 = 8;

/// Number of free-list heads in the header chunk's malloc table, one per
/// small size class from MIN_BLOCK_DELTAS to MAX_BLOCK_DELTAS inclusive.
pub const MALLOC_TABLE_ENTRIES: usize = MAX_BLOCK_DELTAS - MIN_BLOCK_DELTAS + 1;

// ============================================================================
// MALLOC POOL IDS
// Pool ids classify allocations for per-pool accounting. Free space itself is
// shared across pools by size class.
// ============================================================================

/// Misc pool, for anything that does not fit the ids below.
pub const POOL_MISC: u16 = 0x0000;
/// Length-prefixed string records owned by string fields.
pub const POOL_STRING: u16 = 0x0001;
/// Growable-array blocks, metablocks and leaves, regardless of owning type.
pub const POOL_GROWABLE_ARRAY: u16 = 0x0002;
/// Record types allocate from `POOL_FIRST_NODE_TYPE + type_tag`.
pub const POOL_FIRST_NODE_TYPE: u16 = 0x0100;

// ============================================================================
// GROWABLE ARRAY TIERS
// ============================================================================

/// Slot capacity of a max-size growable block and of every metablock leaf.
/// Must be a power of two.
pub const MAX_BLOCK_SIZE: usize = 512;

/// Byte size of the growable-block / metablock header: stored array size
/// (i32) followed by allocated capacity (i32).
pub const GROWABLE_BLOCK_HEADER_BYTES: u64 = 2 * INT_SIZE;

/// A single block shrinks only once the overflow in it falls to
/// `capacity / SINGLE_BLOCK_SHRINK_DIVISOR` or less. Growth doubles, so this
/// gives a 2x hysteresis band against resize thrash.
pub const SINGLE_BLOCK_SHRINK_DIVISOR: usize = 4;

/// A metablock frees trailing leaves once more than this many whole leaves
/// are unused.
pub const METABLOCK_FREE_BLOCK_SLACK: usize = 1;

/// A metablock also frees a trailing leaf once the occupancy of the last
/// used leaf drops to `MAX_BLOCK_SIZE / 2 + METABLOCK_TAIL_SLACK` or less.
pub const METABLOCK_TAIL_SLACK: usize = 1;

// ============================================================================
// LOCKING AND FLUSHING
// ============================================================================

/// While waiting for the write lock the cancel probe is polled at this
/// interval.
pub const CANCELLATION_CHECK_INTERVAL_MS: u64 = 500;

/// Releasing the write lock forces a flush once the dirty chunk count
/// exceeds `cache capacity / DIRTY_FLUSH_DIVISOR`.
pub const DIRTY_FLUSH_DIVISOR: usize = 4;

/// Default chunk capacity of a freshly built [`ChunkCache`]: 4 MiB worth of
/// chunks.
///
/// [`ChunkCache`]: crate::storage::ChunkCache
pub const DEFAULT_CACHE_CHUNKS: usize = (4 * 1024 * 1024) / CHUNK_SIZE;

/// Shard count for the dirty-chunk tracker. Databases map to shards by
/// file id.
pub const DIRTY_SHARD_COUNT: usize = 16;

// ============================================================================
// COMPILE-TIME INVARIANTS
// ============================================================================

const _: () = assert!(CHUNK_SIZE.is_power_of_two(), "chunk size must be a power of two");

const _: () = assert!(
    LARGE_BLOCK_HEADER_SIZE % BLOCK_SIZE_DELTA == 0,
    "large-block header must keep the block area 8-aligned so record \
     addresses stay congruent to BLOCK_HEADER_SIZE mod BLOCK_SIZE_DELTA"
);

const _: () = assert!(MIN_BLOCK_DELTAS == 2, "free-block header fits in two deltas");

const _: () = assert!(
    MAX_BLOCK_SIZE.is_power_of_two(),
    "growable-block clamp must be a power of two"
);

const _: () = assert!(
    GROWABLE_BLOCK_HEADER_BYTES as usize + MAX_BLOCK_SIZE * PTR_SIZE as usize
        <= MAX_SINGLE_BLOCK_MALLOC_SIZE,
    "a max-size growable block must fit in a single small malloc"
);

const _: () = assert!(
    MAX_BLOCK_SIZE * PTR_SIZE as usize <= MAX_SINGLE_BLOCK_MALLOC_SIZE,
    "a raw metablock leaf must fit in a single small malloc"
);
