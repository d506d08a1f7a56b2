use crate::{
    alloc::{rawbuf::RawBuf, region::RegionHeap},
    error::Result,
};

const INIT_LEN: usize = 64;

/// LIFO of registry slots whose payload still has to be scanned. Lives in the
/// metadata heap and is reused from one collection to the next.
pub struct Worklist {
    stack: RawBuf<usize>,
    len: usize,
}

impl Worklist {
    pub fn init(heap: &mut RegionHeap) -> Result<Self> {
        Ok(Self {
            stack: RawBuf::with_capacity(heap, INIT_LEN)?,
            len: 0,
        })
    }

    /// Push, doubling the storage when full
    pub fn push(&mut self, heap: &mut RegionHeap, slot: usize) -> Result<()> {
        if self.len == self.stack.capacity() {
            let cap = (2 * self.stack.capacity()).max(INIT_LEN);
            self.stack.grow(heap, cap)?;
        }
        self.stack.as_mut_slice()[self.len] = slot;
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.stack.as_slice()[self.len])
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.stack.capacity()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn release(&mut self, heap: &mut RegionHeap) {
        self.stack.release(heap);
        self.len = 0;
    }
}
