//! # Node Cache with Pinned Visitors
//!
//! This module keeps a bounded set of node images resident in memory over
//! a [`BlockFile`] and hands out pinned access handles. It is generic over
//! the cached record type so the storage layer stays ignorant of the tree's
//! node layout; the record only has to be a zerocopy view of its block.
//!
//! ## Residency
//!
//! The cache pre-allocates `capacity` boxed record buffers at construction
//! and never allocates on the lookup path. A `hashbrown` map resolves
//! `block index -> slot`; unresident lookups acquire a slot from the
//! free-slot list or, when none is free, evict a victim.
//!
//! ## Eviction
//!
//! A clock hand sweeps the slot array looking for an unpinned slot. Dirty
//! victims are written back through the block file before the slot is
//! reused. A sweep that finds every slot pinned is a hard error: it means
//! one logical operation pinned more nodes than the cache can hold, which
//! is a sizing bug, not a runtime condition to retry.
//!
//! ## Pin Protocol
//!
//! ```text
//! 1. get(index) returns a Visitor and increments the slot's pin count
//! 2. The caller reads or mutates the record through the visitor
//! 3. Dropping the visitor decrements the pin count
//! 4. Slots with a non-zero pin count are never chosen as victims
//! ```
//!
//! A visitor is scoped to one logical tree operation. Holding visitors
//! across operations shrinks the evictable set and will eventually fail
//! an eviction sweep.
//!
//! ## Recycling
//!
//! `recycle` detaches a slot without write-back and returns its block to
//! the file's free list. The slot itself is quarantined until the last
//! visitor pin drops, then rejoins the free-slot list; this keeps a
//! late-held handle from watching its slot be reused mid-operation.
//!
//! ## Interior Mutability
//!
//! The tree traversal holds several visitors at once (a parent, a child,
//! a sibling), so cache methods take `&self` and state lives in
//! `Cell`/`RefCell`. This crate is single-threaded by design; the cells
//! are the single-threaded analogue of an atomically refcounted frame
//! table, and the `RefCell` borrows enforce at runtime that no two
//! handles mutate one node image simultaneously.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::mem::size_of;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use tracing::trace;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::config::MIN_CACHE_CAPACITY;

use super::block_file::BlockFile;

struct Slot<T> {
    index: Cell<u32>,
    pins: Cell<u32>,
    dirty: Cell<bool>,
    recycled: Cell<bool>,
    record: RefCell<Box<T>>,
}

pub struct NodeCache<T> {
    file: RefCell<BlockFile>,
    slots: Vec<Slot<T>>,
    index: RefCell<HashMap<u32, usize>>,
    free_slots: RefCell<Vec<usize>>,
    hand: Cell<usize>,
    scratch: RefCell<Vec<u8>>,
    block_bytes: usize,
}

impl<T> NodeCache<T>
where
    T: FromBytes + IntoBytes + Immutable,
{
    pub fn new(file: BlockFile, capacity: usize) -> Result<Self> {
        ensure!(
            capacity >= MIN_CACHE_CAPACITY,
            "cache capacity {} below minimum {}",
            capacity,
            MIN_CACHE_CAPACITY
        );

        let block_bytes = file.block_bytes();
        ensure!(
            size_of::<T>() <= block_bytes,
            "record type is {} bytes, larger than a {} byte block",
            size_of::<T>(),
            block_bytes
        );

        let slots = (0..capacity)
            .map(|_| {
                let record = T::new_box_zeroed()
                    .map_err(|_| eyre::eyre!("failed to allocate cache slot"))?;
                Ok(Slot {
                    index: Cell::new(0),
                    pins: Cell::new(0),
                    dirty: Cell::new(false),
                    recycled: Cell::new(false),
                    record: RefCell::new(record),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            file: RefCell::new(file),
            free_slots: RefCell::new((0..capacity).rev().collect()),
            slots,
            index: RefCell::new(HashMap::with_capacity(capacity)),
            hand: Cell::new(0),
            scratch: RefCell::new(vec![0u8; block_bytes]),
            block_bytes,
        })
    }

    /// Returns a pinned visitor for the node in block `index`, reading it
    /// from disk if it is not resident.
    pub fn get(&self, index: u32) -> Result<Visitor<'_, T>> {
        if let Some(&slot) = self.index.borrow().get(&index) {
            return Ok(self.pin(slot, index));
        }

        let slot = self.acquire_slot()?;
        if let Err(err) = self.load_slot(slot, index) {
            self.free_slots.borrow_mut().push(slot);
            return Err(err);
        }
        self.install_slot(slot, index, false);
        Ok(self.pin(slot, index))
    }

    /// Allocates a fresh block and returns a visitor over its zeroed,
    /// dirty-marked image.
    pub fn allocate(&self) -> Result<Visitor<'_, T>> {
        let slot = self.acquire_slot()?;
        let index = match self.file.borrow_mut().allocate() {
            Ok(index) => index,
            Err(err) => {
                self.free_slots.borrow_mut().push(slot);
                return Err(err);
            }
        };

        self.slots[slot].record.borrow_mut().as_mut_bytes().fill(0);
        self.install_slot(slot, index, true);
        Ok(self.pin(slot, index))
    }

    /// Detaches the visitor's slot without write-back and recycles its
    /// block. The slot returns to the free-slot list once every pin on it
    /// has dropped.
    pub fn recycle(&self, visitor: Visitor<'_, T>) -> Result<()> {
        let slot = &self.slots[visitor.slot];
        self.index.borrow_mut().remove(&visitor.index);
        slot.dirty.set(false);
        slot.recycled.set(true);
        self.file.borrow_mut().recycle(visitor.index)?;
        trace!(block = visitor.index, "recycled node");
        Ok(())
    }

    /// Writes every dirty resident slot back to the block file. Returns
    /// the number of blocks written.
    pub fn flush_all(&self) -> Result<usize> {
        let resident: Vec<usize> = self.index.borrow().values().copied().collect();
        let mut flushed = 0;
        for slot in resident {
            if self.slots[slot].dirty.get() {
                self.write_slot(slot)?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Reads block 0 into a caller-owned record, bypassing residency.
    pub fn read_root(&self, record: &mut T) -> Result<()> {
        let mut scratch = self.scratch.borrow_mut();
        self.file.borrow_mut().read_block(0, &mut scratch)?;
        record
            .as_mut_bytes()
            .copy_from_slice(&scratch[..size_of::<T>()]);
        Ok(())
    }

    /// Writes a caller-owned record to block 0.
    pub fn write_root(&self, record: &T) -> Result<()> {
        let mut scratch = self.scratch.borrow_mut();
        scratch.fill(0);
        scratch[..size_of::<T>()].copy_from_slice(record.as_bytes());
        self.file.borrow_mut().write_block(0, &scratch)
    }

    pub fn block_count(&self) -> u64 {
        self.file.borrow().size()
    }

    pub fn file_is_fresh(&self) -> bool {
        self.file.borrow().empty()
    }

    pub fn free_blocks(&self) -> Vec<u32> {
        self.file.borrow().free_list().to_vec()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Persists the free list and syncs the data file.
    pub fn sync(&self) -> Result<()> {
        self.file.borrow_mut().sync()
    }

    fn pin(&self, slot: usize, index: u32) -> Visitor<'_, T> {
        let pins = self.slots[slot].pins.get();
        self.slots[slot].pins.set(pins + 1);
        Visitor {
            cache: self,
            slot,
            index,
        }
    }

    fn install_slot(&self, slot: usize, index: u32, dirty: bool) {
        let s = &self.slots[slot];
        s.index.set(index);
        s.dirty.set(dirty);
        s.recycled.set(false);
        self.index.borrow_mut().insert(index, slot);
    }

    fn load_slot(&self, slot: usize, index: u32) -> Result<()> {
        let mut scratch = self.scratch.borrow_mut();
        self.file.borrow_mut().read_block(index, &mut scratch)?;
        self.slots[slot]
            .record
            .borrow_mut()
            .as_mut_bytes()
            .copy_from_slice(&scratch[..size_of::<T>()]);
        Ok(())
    }

    fn write_slot(&self, slot: usize) -> Result<()> {
        let s = &self.slots[slot];
        {
            let record = s.record.borrow();
            let mut scratch = self.scratch.borrow_mut();
            scratch.fill(0);
            scratch[..size_of::<T>()].copy_from_slice(record.as_bytes());
            self.file.borrow_mut().write_block(s.index.get(), &scratch)?;
        }
        s.dirty.set(false);
        trace!(block = s.index.get(), "wrote back node");
        Ok(())
    }

    fn acquire_slot(&self) -> Result<usize> {
        if let Some(slot) = self.free_slots.borrow_mut().pop() {
            return Ok(slot);
        }

        let count = self.slots.len();
        let start = self.hand.get();
        for sweep in 0..count {
            let slot = (start + sweep) % count;
            if self.slots[slot].pins.get() > 0 {
                continue;
            }
            self.hand.set((slot + 1) % count);
            self.evict(slot)?;
            return Ok(slot);
        }

        bail!("node cache exhausted: all {} slots pinned", count)
    }

    fn evict(&self, slot: usize) -> Result<()> {
        let s = &self.slots[slot];
        debug_assert_eq!(s.pins.get(), 0, "evicting a pinned slot");
        if s.dirty.get() {
            self.write_slot(slot)?;
        }
        self.index.borrow_mut().remove(&s.index.get());
        Ok(())
    }
}

/// Pinned handle to one resident node image, valid for the duration of a
/// logical operation. The slot cannot be evicted or reused while any
/// visitor for it is live.
pub struct Visitor<'a, T> {
    cache: &'a NodeCache<T>,
    slot: usize,
    index: u32,
}

impl<T> std::fmt::Debug for Visitor<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Visitor")
            .field("slot", &self.slot)
            .field("index", &self.index)
            .finish()
    }
}

impl<T> Visitor<'_, T>
where
    T: FromBytes + IntoBytes + Immutable,
{
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Immutable view of the cached record.
    pub fn read(&self) -> Ref<'_, T> {
        Ref::map(self.cache.slots[self.slot].record.borrow(), |r| &**r)
    }

    /// Mutable view of the cached record; marks the slot dirty.
    pub fn modify(&self) -> RefMut<'_, T> {
        let slot = &self.cache.slots[self.slot];
        slot.dirty.set(true);
        RefMut::map(slot.record.borrow_mut(), |r| &mut **r)
    }
}

impl<T> Drop for Visitor<'_, T> {
    fn drop(&mut self) {
        let slot = &self.cache.slots[self.slot];
        let pins = slot.pins.get();
        debug_assert!(pins > 0, "visitor dropped on an unpinned slot");
        slot.pins.set(pins - 1);
        if pins == 1 && slot.recycled.get() {
            slot.recycled.set(false);
            self.cache.free_slots.borrow_mut().push(self.slot);
        }
    }
}
