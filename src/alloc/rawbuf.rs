use std::{mem, ptr::NonNull, slice};

use bytemuck::Zeroable;

use crate::{
    alloc::region::RegionHeap,
    error::{Error, Result},
};

/// A growable, heap-agnostic array of `T`s with no RAII -- you must `release()`
/// it yourself, into the same [`RegionHeap`] it was allocated from. This is how
/// the bookkeeper keeps its tables in the metadata heap, without going through
/// `malloc()` (which is us).
///
/// Every slot up to `capacity()` is always initialized: new storage is zeroed,
/// hence the [`Zeroable`] bound.
pub struct RawBuf<T>
where
    T: Copy + Zeroable,
{
    data: NonNull<T>,
    cap: usize,
}

// SAFETY: a `RawBuf` uniquely owns its storage, like a `Vec`
unsafe impl<T: Copy + Zeroable + Send> Send for RawBuf<T> {}

impl<T> RawBuf<T>
where
    T: Copy + Zeroable,
{
    pub const fn dangling() -> Self {
        Self {
            data: NonNull::dangling(),
            cap: 0,
        }
    }

    pub fn with_capacity(heap: &mut RegionHeap, cap: usize) -> Result<Self> {
        let mut buf = Self::dangling();
        buf.grow(heap, cap)?;
        Ok(buf)
    }

    pub const fn capacity(&self) -> usize {
        self.cap
    }

    fn bytes(cap: usize) -> Result<usize> {
        cap.checked_mul(mem::size_of::<T>())
            .ok_or(Error::MetadataExhausted(usize::MAX))
    }

    /// Grow to `new_cap` elements, keeping the contents and zeroing the tail.
    /// Fails without touching the buffer if the heap is out of room.
    pub fn grow(&mut self, heap: &mut RegionHeap, new_cap: usize) -> Result<()> {
        debug_assert!(new_cap >= self.cap);
        let new_bytes = Self::bytes(new_cap)?;
        let data = if self.cap == 0 {
            heap.calloc(new_cap, mem::size_of::<T>())
        } else {
            // SAFETY: `data` came from `heap` with exactly `bytes(cap)` bytes
            unsafe { heap.realloc(self.data.as_ptr().cast(), Self::bytes(self.cap)?, new_bytes) }
        };
        let Some(data) = NonNull::new(data.cast::<T>()) else {
            return Err(Error::MetadataExhausted(new_bytes));
        };
        if self.cap != 0 {
            // SAFETY: the tail `[cap, new_cap)` is inside the new allocation,
            // and all-zero is a valid `T`
            unsafe { data.as_ptr().add(self.cap).write_bytes(0, new_cap - self.cap) };
        }
        self.data = data;
        self.cap = new_cap;
        Ok(())
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY: every slot below `cap` is initialized (see type docs)
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.cap) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as `as_slice()`, and we are the unique owner
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.cap) }
    }

    /// Give the storage back to `heap`. The buffer is empty afterwards.
    pub fn release(&mut self, heap: &mut RegionHeap) {
        if self.cap == 0 {
            return;
        }
        let bytes = self.cap * mem::size_of::<T>();
        // SAFETY: allocated from `heap` with exactly `bytes` bytes
        unsafe { heap.free(self.data.as_ptr().cast(), bytes) };
        *self = Self::dangling();
    }
}
