//! The book: one [`AllocRecord`] per object living in the safe heap.
//!
//! Records sit in a slot table that only ever grows (doubling), with emptied
//! slots reused before growing. Next to it we keep the occupied slots sorted
//! by address, so that "which objects does this word point into?" -- asked
//! once for every word the tracer reads -- is a binary search rather than a
//! walk over the whole book.

use std::ops::Range;

use bytemuck::Zeroable;

use crate::{
    alloc::{rawbuf::RawBuf, region::RegionHeap},
    error::Result,
};

pub const INIT_LENGTH: usize = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct AllocRecord {
    /// Where the object starts. `0` marks an empty slot.
    pub address: usize,
    /// The requested size, in bytes
    pub size: usize,
    /// The program has called `free()` on it
    pub requested_free: bool,
    /// Reached during the current collection. Never survives a sweep.
    pub marked: bool,
    /// Sweeps this object has sat through unreached
    pub unreachable_cnt: u8,
}

// SAFETY: all-zero is the empty slot
unsafe impl Zeroable for AllocRecord {}

impl AllocRecord {
    pub const fn is_empty(&self) -> bool {
        self.address == 0
    }

    /// One past the end. Pointers equal to this still count as pointing into
    /// the object.
    pub const fn end(&self) -> usize {
        self.address.saturating_add(self.size)
    }

    pub const fn contains(&self, value: usize) -> bool {
        value >= self.address && value <= self.end()
    }
}

pub struct Registry {
    slots: RawBuf<AllocRecord>,
    /// Slots ever used, everything at and above this is untouched
    cnt: usize,
    /// Empty slots below `cnt`
    holes: usize,
    /// Occupied slots, sorted by address
    index: RawBuf<usize>,
    live: usize,
}

impl Registry {
    pub fn init(heap: &mut RegionHeap) -> Result<Self> {
        Ok(Self {
            slots: RawBuf::with_capacity(heap, INIT_LENGTH)?,
            cnt: 0,
            holes: 0,
            index: RawBuf::with_capacity(heap, INIT_LENGTH)?,
            live: 0,
        })
    }

    /// Number of tracked objects
    pub const fn len(&self) -> usize {
        self.live
    }

    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slots the table has room for
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Slots ever used. Every occupied slot is below this.
    pub const fn high_water(&self) -> usize {
        self.cnt
    }

    pub fn get(&self, slot: usize) -> &AllocRecord {
        &self.slots.as_slice()[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut AllocRecord {
        &mut self.slots.as_mut_slice()[slot]
    }

    /// Occupied slots, in slot order
    pub fn iter_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.cnt).filter(|&slot| !self.get(slot).is_empty())
    }

    fn sorted(&self) -> &[usize] {
        &self.index.as_slice()[..self.live]
    }

    /// Slot of the `pos`th object in address order
    pub fn slot_at(&self, pos: usize) -> usize {
        self.sorted()[pos]
    }

    /// Pick a slot for a new record: append while there is room, then fill
    /// holes, then grow
    fn claim_slot(&mut self, heap: &mut RegionHeap) -> Result<usize> {
        if self.cnt < self.slots.capacity() {
            self.cnt += 1;
            return Ok(self.cnt - 1);
        }
        if self.holes > 0 {
            if let Some(slot) = (0..self.cnt).find(|&slot| self.get(slot).is_empty()) {
                self.holes -= 1;
                return Ok(slot);
            }
        }
        let cap = 2 * self.slots.capacity();
        self.slots.grow(heap, cap)?;
        self.cnt += 1;
        Ok(self.cnt - 1)
    }

    /// Track a new object, returning its slot
    pub fn insert(&mut self, heap: &mut RegionHeap, address: usize, size: usize) -> Result<usize> {
        debug_assert_ne!(address, 0, "0 is the empty slot");
        if self.live == self.index.capacity() {
            let cap = 2 * self.index.capacity();
            self.index.grow(heap, cap)?;
        }
        let slot = self.claim_slot(heap)?;
        *self.get_mut(slot) = AllocRecord {
            address,
            size,
            ..AllocRecord::default()
        };

        let pos = self
            .sorted()
            .partition_point(|&s| self.get(s).address < address);
        let live = self.live;
        let index = &mut self.index.as_mut_slice()[..live + 1];
        index.copy_within(pos..live, pos + 1);
        index[pos] = slot;
        self.live += 1;
        Ok(slot)
    }

    fn index_position(&self, address: usize) -> Option<usize> {
        let pos = self
            .sorted()
            .partition_point(|&s| self.get(s).address < address);
        (pos < self.live && self.get(self.slot_at(pos)).address == address).then_some(pos)
    }

    /// Slot holding an object that starts exactly at `address`
    pub fn find_exact(&self, address: usize) -> Option<usize> {
        if address == 0 {
            return None;
        }
        self.index_position(address).map(|pos| self.slot_at(pos))
    }

    /// Positions (for [`Registry::slot_at()`]) of every object whose
    /// `[address, address + size]` span contains `value`.
    ///
    /// Objects never overlap, so their ends ascend in address order too, and
    /// the matches are a run ending at the last object starting at or below
    /// `value`. Usually it's one object, two when `value` is both one past
    /// the end of an object and the start of the next.
    pub fn containing(&self, value: usize) -> Range<usize> {
        let hi = self
            .sorted()
            .partition_point(|&s| self.get(s).address <= value);
        let mut lo = hi;
        while lo > 0 && self.get(self.slot_at(lo - 1)).contains(value) {
            lo -= 1;
        }
        lo..hi
    }

    /// Empty a slot
    pub fn remove_slot(&mut self, slot: usize) {
        let address = self.get(slot).address;
        debug_assert_ne!(address, 0, "removing an empty slot");
        if let Some(pos) = self.index_position(address) {
            let live = self.live;
            self.index.as_mut_slice()[..live].copy_within(pos + 1..live, pos);
            self.live -= 1;
        }
        *self.get_mut(slot) = AllocRecord::default();
        self.holes += 1;
    }

    /// Empty the slot tracking `address`, `false` if there is none
    pub fn remove(&mut self, address: usize) -> bool {
        match self.find_exact(address) {
            Some(slot) => {
                self.remove_slot(slot);
                true
            }
            None => false,
        }
    }

    pub fn release(&mut self, heap: &mut RegionHeap) {
        self.slots.release(heap);
        self.index.release(heap);
        self.cnt = 0;
        self.holes = 0;
        self.live = 0;
    }
}
