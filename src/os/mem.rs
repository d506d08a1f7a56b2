use std::{cell::Cell, io, mem::ManuallyDrop, ptr, sync::LazyLock};

use libc::{
    mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE,
};

use crate::{
    error::{Error, Result},
    util::{hint::cold, num::round_up},
};

pub static PAGE_SIZE: LazyLock<usize> = LazyLock::new(page_size::get);

/// An owned, page-aligned anonymous mapping
#[derive(Debug)]
pub struct MmapRegion {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is plain memory owned by this value, nothing about it is
// tied to the thread that created it
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned arena of memory of `size` bytes (or
    /// more -- the resulting arena is always a whole number of pages).
    ///
    /// `hint` is handed to the kernel as a placement hint only, a null hint
    /// lets the kernel choose. Nothing is reserved in swap (`MAP_NORESERVE`),
    /// so multi-gigabyte regions cost nothing until they are touched.
    pub fn map(size: usize, hint: usize) -> Result<MmapRegion> {
        if size == 0 {
            return Err(Error::EmptyMap);
        }
        let size = round_up(size, *PAGE_SIZE);
        // SAFETY: fresh anonymous mapping, no existing memory is affected
        // since we do not pass `MAP_FIXED`
        let ptr = unsafe {
            mmap(
                hint as *mut _,
                size,
                PROT_READ | PROT_WRITE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return cold(|| {
                Err(Error::Map {
                    size,
                    source: io::Error::last_os_error(),
                })
            });
        }
        Ok(MmapRegion {
            ptr: ptr as *mut u8,
            size,
        })
    }

    pub fn base(&self) -> usize {
        self.ptr as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.size
    }

    /// Unmap, reporting failure (which [`Drop`] can't)
    pub fn unmap(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        // SAFETY: see `Drop`
        if unsafe { munmap(this.ptr as _, this.size) } != 0 {
            return Err(Error::Unmap(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - The address addr must be a multiple of the page size (but length
        //   need not be). This is guaranteed true because we can only construct
        //   this region as page-aligned
        // - All pages containing a part of the indicated range are unmapped.
        //   This is fine, because we requested a region of at least `self.size`
        //   bytes and never mutated it.
        unsafe {
            munmap(self.ptr as _, self.size);
        }
    }
}

/// A bump "system allocator" over a fixed address range, which is how a
/// `dlmalloc` instance gets confined to one [`MmapRegion`]. Whenever dlmalloc
/// wants a new segment we hand out the next page-rounded chunk of the range,
/// panicking is never an option, so running out just reports failure.
///
/// Memory is never given back. The range is always fresh anonymous memory, so
/// everything we hand out is zeroed.
pub struct RegionSystem {
    base: usize,
    size: usize,
    sp: Cell<usize>,
}

impl RegionSystem {
    /// # Safety
    ///
    /// `[base, base + size)` must be mapped read/write, must outlive this
    /// value (and the dlmalloc instance built on it) and must not be handed out
    /// by anyone else.
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self {
            base,
            size,
            sp: Cell::new(0),
        }
    }

    /// Bytes handed out to dlmalloc so far
    pub fn used(&self) -> usize {
        self.sp.get()
    }
}

// SAFETY:
// - `alloc()` only hands out disjoint, page-aligned chunks of the range,
//   which the constructor's caller guarantees is ours and mapped
// - we never claim to release anything, so dlmalloc never frees or remaps
//   memory behind our back
unsafe impl dlmalloc::Allocator for RegionSystem {
    fn alloc(&self, size: usize) -> (*mut u8, usize, u32) {
        let size = round_up(size, *PAGE_SIZE);
        let sp = self.sp.get();
        if self.size - sp < size {
            return (ptr::null_mut(), 0, 0);
        }
        self.sp.set(sp + size);
        ((self.base + sp) as *mut u8, size, 0)
    }

    fn remap(&self, _: *mut u8, _: usize, _: usize, _: bool) -> *mut u8 {
        ptr::null_mut()
    }

    fn free_part(&self, _: *mut u8, _: usize, _: usize) -> bool {
        false
    }

    fn free(&self, _: *mut u8, _: usize) -> bool {
        false
    }

    fn can_release_part(&self, _: u32) -> bool {
        false
    }

    fn allocates_zeros(&self) -> bool {
        true
    }

    fn page_size(&self) -> usize {
        *PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use dlmalloc::Allocator;

    use super::*;

    #[test]
    fn map_rounds_up_to_whole_pages() {
        let region = MmapRegion::map(100, 0).unwrap();
        assert_eq!(region.size(), *PAGE_SIZE);
        assert!(region.contains(region.base()));
        assert!(!region.contains(region.base() + region.size()));
        // Fresh anonymous memory reads as zero and is writable
        unsafe {
            assert_eq!(region.as_ptr().read(), 0);
            region.as_ptr().write(42);
            assert_eq!(region.as_ptr().read(), 42);
        }
        region.unmap().unwrap();
    }

    #[test]
    fn zero_sized_map_is_rejected() {
        assert!(matches!(MmapRegion::map(0, 0), Err(Error::EmptyMap)));
    }

    #[test]
    fn region_system_bumps_until_exhausted() {
        let region = MmapRegion::map(4 * *PAGE_SIZE, 0).unwrap();
        let system = unsafe { RegionSystem::new(region.base(), region.size()) };
        let (a, a_size, _) = system.alloc(1);
        assert_eq!(a as usize, region.base());
        assert_eq!(a_size, *PAGE_SIZE);
        let (b, b_size, _) = system.alloc(2 * *PAGE_SIZE);
        assert_eq!(b as usize, region.base() + *PAGE_SIZE);
        assert_eq!(b_size, 2 * *PAGE_SIZE);
        let (c, _, _) = system.alloc(2 * *PAGE_SIZE);
        assert!(c.is_null());
        assert_eq!(system.used(), 3 * *PAGE_SIZE);
    }
}
