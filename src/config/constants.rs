//! # perchdb Configuration Constants
//!
//! This module centralizes the tree geometry and cache sizing constants.
//! Constants that depend on each other are co-located and guarded by
//! compile-time assertions so that a careless edit fails the build instead
//! of corrupting a database file.
//!
//! ## Dependency Graph
//!
//! ```text
//! KEY_BYTES (68)
//!       │
//!       └─> ENTRY_BYTES (derived: child ref + key + value)
//!             │
//!             └─> NODE_BYTES (derived: node header + (MAX_ENTRIES + 1) entries)
//!                   │
//!                   └─> BLOCK_BYTES (NODE_BYTES rounded up to 4 KiB pages)
//!
//! MAX_ENTRIES (50)
//!       │
//!       ├─> AMORT_SIZE (2/3 of MAX_ENTRIES)
//!       │     Rebalancing moves entries into a sibling below this count
//!       │     instead of splitting or merging.
//!       │
//!       └─> MERGE_SIZE (1/3 of MAX_ENTRIES)
//!             A node at or below this count after an erase must rebalance.
//!
//! CACHE_CAPACITY (50)
//!       │
//!       └─> Must stay comfortably above 3 × tree height: one traversal
//!           pins up to three nodes per level (parent, child, one sibling).
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `MERGE_SIZE < AMORT_SIZE <= MAX_ENTRIES` — the rebalancing thresholds
//!    must be ordered or amortization can oscillate.
//! 2. `MAX_ENTRIES >= 10` — smaller nodes make the slack-slot overflow
//!    scheme degenerate.
//! 3. `NODE_BYTES <= BLOCK_BYTES` — a node image must fit its block.
//!
//! ## Modifying Constants
//!
//! `KEY_BYTES` and `MAX_ENTRIES` define the on-disk layout. Changing either
//! makes existing database files unreadable; there is no migration path.

/// Width of every key in bytes. Shorter keys are zero-padded on the right.
pub const KEY_BYTES: usize = 68;

/// Maximum entries a node may hold between operations (the B of the tree).
/// Nodes carry one extra slot so an insert can transiently overflow to
/// `MAX_ENTRIES + 1` before rebalancing decides between amortize and split.
pub const MAX_ENTRIES: usize = 50;

/// Sibling occupancy threshold for rebalancing. An overfull node amortizes
/// into a sibling below this count; an underfull node borrows from a
/// sibling at or above it.
pub const AMORT_SIZE: usize = MAX_ENTRIES * 2 / 3;

/// Underflow threshold. A non-root node at or below this count after an
/// erase must amortize or merge.
pub const MERGE_SIZE: usize = MAX_ENTRIES / 3;

/// Number of node images the cache keeps resident.
pub const CACHE_CAPACITY: usize = 50;

/// Floor for cache capacity. A capacity of 16 covers trees of height 5,
/// which at `MAX_ENTRIES = 50` is far beyond the 31-bit block index space.
pub const MIN_CACHE_CAPACITY: usize = 16;

/// Largest representable block index, and the leaf-chain terminator.
/// The high bit of the index word carries the node kind, so indexes are
/// 31-bit values.
pub const MAX_INDEX: u32 = 0x7FFF_FFFF;

/// Size of one entry on disk: an 8-byte child reference, the key, and a
/// 4-byte value. Leaf entries keep the child reference zeroed.
pub const ENTRY_BYTES: usize = 8 + KEY_BYTES + 4;

/// Size of the node header on disk: the link word (kind bit plus next-leaf
/// index), a reserved word, and the entry count.
pub const NODE_HEADER_BYTES: usize = 12;

/// Size of a serialized node.
pub const NODE_BYTES: usize = NODE_HEADER_BYTES + (MAX_ENTRIES + 1) * ENTRY_BYTES;

/// On-disk block size: the node size rounded up to whole 4 KiB pages.
pub const BLOCK_BYTES: usize = ((NODE_BYTES - 1) / 4096 + 1) * 4096;

const _: () = assert!(
    MERGE_SIZE < AMORT_SIZE && AMORT_SIZE <= MAX_ENTRIES,
    "rebalancing thresholds must satisfy MERGE_SIZE < AMORT_SIZE <= MAX_ENTRIES"
);

const _: () = assert!(MAX_ENTRIES >= 10, "MAX_ENTRIES too small for slack-slot rebalancing");

const _: () = assert!(NODE_BYTES <= BLOCK_BYTES, "node image must fit one block");

const _: () = assert!(
    CACHE_CAPACITY >= MIN_CACHE_CAPACITY,
    "CACHE_CAPACITY below the construction floor"
);
