//! The heap that serves every allocation made while the runtime initializes.
//!
//! Resolving the original `malloc()` with `dlsym()`, reading the environment
//! and setting up logging all allocate, and at that point the real allocator
//! isn't reachable yet. So they get a dumb bump arena instead. It is tiny in
//! practice, and only the most recent block can actually be freed.

use std::{mem, ptr};

use crate::{
    alloc::region::DLMALLOC_MIN_ALIGN,
    os::mem::MmapRegion,
    util::{hint::cold, num::round_up},
};

/// Reserved, not committed (`MAP_NORESERVE`)
pub const BOOTSTRAP_SIZE: usize = 64 << 20;

/// Sits in front of every bootstrap block. Padded so the payload keeps the
/// same alignment as dlmalloc's.
#[repr(C, align(16))]
struct BlockHeader {
    /// The exact requested size of this allocation
    size: usize,
}

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE == DLMALLOC_MIN_ALIGN);

pub struct BootstrapHeap {
    region: Option<MmapRegion>,
    /// Offset of the next free byte
    sp: usize,
    /// Offset of the most recent block's header, the only one we can pop
    last: Option<usize>,
}

impl BootstrapHeap {
    pub const fn new() -> Self {
        Self {
            region: None,
            sp: 0,
            last: None,
        }
    }

    pub fn owns(&self, addr: usize) -> bool {
        self.region.as_ref().is_some_and(|r| r.contains(addr))
    }

    fn region(&mut self) -> Option<&MmapRegion> {
        if self.region.is_none() {
            self.region = cold(|| MmapRegion::map(BOOTSTRAP_SIZE, 0).ok());
        }
        self.region.as_ref()
    }

    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        let Some(block) = size.checked_add(HEADER_SIZE) else {
            return ptr::null_mut();
        };
        let block = round_up(block, DLMALLOC_MIN_ALIGN);
        let sp = self.sp;
        let Some(region) = self.region() else {
            return ptr::null_mut();
        };
        if region.size() - sp < block {
            return ptr::null_mut();
        }
        let base = region.as_ptr();
        // SAFETY: `sp + block <= region.size()`, so header and payload are in
        // the mapping, and `sp` is always a multiple of the header alignment
        let data = unsafe {
            let header = base.add(sp).cast::<BlockHeader>();
            header.write(BlockHeader { size });
            base.add(sp + HEADER_SIZE)
        };
        self.last = Some(sp);
        self.sp = sp + block;
        data
    }

    pub fn calloc(&mut self, nmemb: usize, size: usize) -> *mut u8 {
        let Some(bytes) = nmemb.checked_mul(size) else {
            return ptr::null_mut();
        };
        let data = self.malloc(bytes);
        if !data.is_null() {
            // Popped blocks get handed out again, so fresh is not always zero
            // SAFETY: just allocated with `bytes` bytes
            unsafe { data.write_bytes(0, bytes) };
        }
        data
    }

    /// The requested size of a bootstrap block
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this heap's `malloc()`
    pub unsafe fn size_of(&self, ptr: *const u8) -> usize {
        unsafe { ptr.sub(HEADER_SIZE).cast::<BlockHeader>().read().size }
    }

    /// # Safety
    ///
    /// `ptr` must be `NULL` or have come from this heap
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(size);
        }
        let old_size = unsafe { self.size_of(ptr) };
        let new = self.malloc(size);
        if !new.is_null() {
            // SAFETY: both blocks are live and disjoint (bump allocation)
            unsafe { ptr::copy_nonoverlapping(ptr, new, old_size.min(size)) };
        }
        new
    }

    /// Pops the block if it is the most recent one, otherwise leaks it
    ///
    /// # Safety
    ///
    /// `ptr` must be `NULL` or a live block from this heap
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(region) = &self.region else {
            return;
        };
        if ptr.is_null() {
            return;
        }
        let header = ptr as usize - HEADER_SIZE - region.base();
        if self.last == Some(header) {
            self.sp = header;
            self.last = None;
        }
    }

    /// Bytes handed out so far
    pub fn used(&self) -> usize {
        self.sp
    }
}

impl Default for BootstrapHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_lazily_and_owns_its_blocks() {
        let mut heap = BootstrapHeap::new();
        assert!(!heap.owns(0x1000));
        let p = heap.malloc(24);
        assert!(heap.owns(p as usize));
        assert_eq!(p as usize % DLMALLOC_MIN_ALIGN, 0);
        assert_eq!(unsafe { heap.size_of(p) }, 24);
    }

    #[test]
    fn only_the_last_block_is_popped() {
        let mut heap = BootstrapHeap::new();
        let a = heap.malloc(8);
        let b = heap.malloc(8);
        let used = heap.used();
        unsafe { heap.free(a) };
        assert_eq!(heap.used(), used);
        unsafe { heap.free(b) };
        assert!(heap.used() < used);
        // `b`'s space is reused, and calloc still hands out zeroes
        unsafe { b.write_bytes(0xff, 8) };
        let c = heap.calloc(1, 8);
        assert_eq!(c, b);
        assert_eq!(unsafe { c.cast::<u64>().read() }, 0);
    }

    #[test]
    fn realloc_copies_the_old_payload() {
        let mut heap = BootstrapHeap::new();
        let p = heap.malloc(4);
        unsafe {
            p.cast::<u32>().write(0xfeed);
            let q = heap.realloc(p, 64);
            assert_ne!(p, q);
            assert_eq!(q.cast::<u32>().read(), 0xfeed);
            assert_eq!(heap.size_of(q), 64);
        }
    }
}
