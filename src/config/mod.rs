//! Configuration constants for tree geometry, block layout, and cache
//! sizing. See `constants` for the dependency graph between values.

mod constants;

pub use constants::{
    AMORT_SIZE, BLOCK_BYTES, CACHE_CAPACITY, ENTRY_BYTES, KEY_BYTES, MAX_ENTRIES, MAX_INDEX,
    MERGE_SIZE, MIN_CACHE_CAPACITY, NODE_BYTES, NODE_HEADER_BYTES,
};
