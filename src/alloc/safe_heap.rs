//! The safe heap: a [`RegionHeap`] whose pages are bound to their own
//! protection key.
//!
//! Objects allocated inside safe blocks live here, and so do the ones waiting
//! out their quarantine. Outside a safe block the key is `NoAccess`, so any
//! stale pointer into the heap faults rather than reading reused memory.

use crate::{
    alloc::{bookkeeper::TrackedHeap, region::RegionHeap},
    config::Config,
    error::Result,
    os::{
        mem::MmapRegion,
        pkey::{Permission, ProtectionKey},
    },
};

pub struct SafeHeap {
    // Field order is teardown order: the mapping goes before the key that
    // guards it
    heap: RegionHeap,
    key: ProtectionKey,
}

impl SafeHeap {
    /// Allocate a key, map the region, bind one to the other, and put a
    /// sub-allocator in it. Anything already set up is released again if a
    /// later step fails.
    pub fn create(config: &Config) -> Result<Self> {
        let key = ProtectionKey::alloc(config.isolation).inspect_err(|e| {
            log::error!("[safe_heap] {e}");
        })?;
        let region = MmapRegion::map(config.heap_size, config.heap_hint).inspect_err(|e| {
            log::error!("[safe_heap] {e}");
        })?;
        key.protect(region.base(), region.size()).inspect_err(|e| {
            log::error!("[safe_heap] {e}");
        })?;
        log::debug!(
            "[safe_heap] {:#x} - {:#x} bound to key {}",
            region.base(),
            region.base() + region.size(),
            key.id()
        );
        Ok(Self {
            heap: RegionHeap::new(region),
            key,
        })
    }

    /// Tear down in reverse order of [`SafeHeap::create()`]. Every step runs,
    /// the first failure is the one reported.
    pub fn destroy(self) -> Result<()> {
        let Self { heap, key } = self;
        let unmapped = heap.into_region().unmap();
        let freed = key.free();
        unmapped.and(freed)
    }

    pub fn get_permission(&self) -> Permission {
        self.key.permission()
    }

    /// Change the calling thread's access to the heap
    pub fn set_permission(&self, perm: Permission) -> Result<()> {
        self.key.set_permission(perm)
    }

    pub fn key(&self) -> &ProtectionKey {
        &self.key
    }

    pub fn base(&self) -> usize {
        self.heap.base()
    }

    pub fn size(&self) -> usize {
        self.heap.size()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.heap.contains(addr)
    }

    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        self.heap.malloc(size)
    }

    pub fn calloc(&mut self, nmemb: usize, size: usize) -> *mut u8 {
        self.heap.calloc(nmemb, size)
    }

    /// # Safety
    ///
    /// See [`RegionHeap::free()`]
    pub unsafe fn free(&mut self, ptr: *mut u8, size: usize) {
        unsafe { self.heap.free(ptr, size) }
    }
}

// SAFETY: forwards to the sub-allocator
unsafe impl TrackedHeap for SafeHeap {
    unsafe fn release(&mut self, addr: usize, size: usize) {
        unsafe { self.free(addr as *mut u8, size) }
    }
}
