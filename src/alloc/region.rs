//! `dlmalloc()` confined to a single mapping.
//!
//! Every heap in the runtime is one of these: the safe heap's sub-allocator,
//! and the metadata heap the bookkeeper keeps its tables in. Confining each
//! instance to one region is what makes "is this a pointer into the safe
//! heap?" a bounds check, and what lets one protection key cover exactly the
//! tracked objects.

use dlmalloc::Dlmalloc;

use crate::{
    error::Result,
    os::mem::{MmapRegion, RegionSystem},
};

/// dlmalloc hands out 16-byte aligned chunks
pub const DLMALLOC_MIN_ALIGN: usize = 16;

pub struct RegionHeap {
    // Declared before `region`: dlmalloc's segments live inside the region, so
    // it has to go first
    dl: Dlmalloc<RegionSystem>,
    region: MmapRegion,
}

// SAFETY: the heap owns its region outright and dlmalloc keeps no thread-local
// state, so moving the whole thing to another thread is fine
unsafe impl Send for RegionHeap {}

impl RegionHeap {
    pub fn new(region: MmapRegion) -> Self {
        // SAFETY:
        // - the region is mapped read/write and owned by us
        // - `region` outlives `dl` (field order)
        let system = unsafe { RegionSystem::new(region.base(), region.size()) };
        Self {
            dl: Dlmalloc::new_with_allocator(system),
            region,
        }
    }

    /// Map a fresh region of `size` bytes (see [`MmapRegion::map()`]) and put
    /// a heap in it
    pub fn map(size: usize, hint: usize) -> Result<Self> {
        Ok(Self::new(MmapRegion::map(size, hint)?))
    }

    pub fn base(&self) -> usize {
        self.region.base()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.region.contains(addr)
    }

    /// Tear down the heap, handing back the region so the caller can unmap it
    /// and see whether that worked
    pub fn into_region(self) -> MmapRegion {
        let Self { dl, region } = self;
        drop(dl);
        region
    }

    /// `NULL` on exhaustion
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        // SAFETY: dlmalloc's only requirement is a power-of-two alignment
        unsafe { self.dl.malloc(size, DLMALLOC_MIN_ALIGN) }
    }

    /// Zeroed `nmemb * size` bytes, `NULL` on exhaustion or if the product
    /// overflows
    pub fn calloc(&mut self, nmemb: usize, size: usize) -> *mut u8 {
        let Some(bytes) = nmemb.checked_mul(size) else {
            return std::ptr::null_mut();
        };
        // SAFETY: as `malloc()`
        unsafe { self.dl.calloc(bytes, DLMALLOC_MIN_ALIGN) }
    }

    /// # Safety
    ///
    /// `ptr` must be a live allocation from this heap, requested with exactly
    /// `old_size` bytes
    pub unsafe fn realloc(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        unsafe { self.dl.realloc(ptr, old_size, DLMALLOC_MIN_ALIGN, new_size) }
    }

    /// # Safety
    ///
    /// `ptr` must be a live allocation from this heap, requested with exactly
    /// `size` bytes. It is dead afterwards.
    pub unsafe fn free(&mut self, ptr: *mut u8, size: usize) {
        unsafe { self.dl.free(ptr, size, DLMALLOC_MIN_ALIGN) }
    }
}
