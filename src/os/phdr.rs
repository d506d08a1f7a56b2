//! Where the roots are: the writable data of every loaded module, and the
//! slice of the current thread's stack that belongs to the safe block.

use std::{
    ffi::{c_int, c_void},
    mem,
};

use libc::{dl_iterate_phdr, dl_phdr_info, size_t, PF_W, PT_LOAD};

use crate::{
    error::{Error, Result},
    util::num::{word_align_down, word_align_up},
};

/// Max num of data segments
pub const MAX_SEGMENTS: usize = 64;

/// A bounded set of `[start, end)` address ranges. Fixed storage, because it is
/// filled in from inside `free()`.
#[derive(Clone)]
pub struct MemoryRegionSet {
    start: [usize; MAX_SEGMENTS],
    end: [usize; MAX_SEGMENTS],
    cnt: usize,
}

impl MemoryRegionSet {
    pub const fn new() -> Self {
        Self {
            start: [0; MAX_SEGMENTS],
            end: [0; MAX_SEGMENTS],
            cnt: 0,
        }
    }

    pub const fn len(&self) -> usize {
        self.cnt
    }

    pub const fn is_empty(&self) -> bool {
        self.cnt == 0
    }

    pub fn clear(&mut self) {
        self.cnt = 0;
    }

    /// Add a range, trimmed inwards to whole words. Empty ranges are dropped.
    pub fn push(&mut self, start: usize, end: usize) -> Result<()> {
        if self.cnt >= MAX_SEGMENTS {
            return Err(Error::TooManySegments(MAX_SEGMENTS));
        }
        let (start, end) = (word_align_up(start), word_align_down(end));
        if start >= end {
            return Ok(());
        }
        self.start[self.cnt] = start;
        self.end[self.cnt] = end;
        self.cnt += 1;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.start[..self.cnt]
            .iter()
            .copied()
            .zip(self.end[..self.cnt].iter().copied())
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.iter().any(|(start, end)| addr >= start && addr < end)
    }
}

impl Default for MemoryRegionSet {
    fn default() -> Self {
        Self::new()
    }
}

/// The live part of a thread's stack since safe-block entry. The stack grows
/// down, so `top <= bottom`. Zero in both means "not in a safe block".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackRegion {
    pub top: usize,
    pub bottom: usize,
}

impl StackRegion {
    pub const EMPTY: StackRegion = StackRegion { top: 0, bottom: 0 };

    pub const fn new(top: usize, bottom: usize) -> Self {
        Self { top, bottom }
    }

    /// Set the bottom (the caller's frame at block entry). Aligning up keeps
    /// the word the frame address points into inside the window.
    pub fn set_bottom(&mut self, frame: usize) {
        self.bottom = word_align_up(frame);
    }

    /// Set the top (the stack pointer at the time of a free request)
    pub fn set_top(&mut self, sp: usize) {
        self.top = word_align_down(sp);
    }

    pub const fn is_set(&self) -> bool {
        self.bottom != 0
    }

    pub fn clear(&mut self) {
        *self = Self::EMPTY;
    }

    /// The range to scan, `None` if the window is unset or inverted
    pub fn range(&self) -> Option<(usize, usize)> {
        (self.top != 0 && self.top < self.bottom).then_some((self.top, self.bottom))
    }
}

struct CollectState {
    segments: MemoryRegionSet,
    own_module_marker: Option<usize>,
    error: Option<Error>,
}

/// Anything in this crate's own data segment. Used to recognize (and skip)
/// the module that holds the runtime's own state.
static OWN_MODULE_MARKER: u8 = 0;

fn module_contains(info: &dl_phdr_info, addr: usize) -> bool {
    phdrs(info).any(|phdr| {
        let start = info.dlpi_addr as usize + phdr.p_vaddr as usize;
        phdr.p_type == PT_LOAD && addr >= start && addr < start + phdr.p_memsz as usize
    })
}

fn phdrs(info: &dl_phdr_info) -> impl Iterator<Item = &libc::Elf64_Phdr> + '_ {
    (0..info.dlpi_phnum as usize).map(move |i| {
        // SAFETY: the loader guarantees `dlpi_phdr` points at `dlpi_phnum`
        // program headers
        unsafe { &*info.dlpi_phdr.add(i) }
    })
}

unsafe extern "C" fn data_segments_cb(
    info: *mut dl_phdr_info,
    size: size_t,
    data: *mut c_void,
) -> c_int {
    // Older loaders hand out a shorter struct, make sure the fields we read
    // are there
    if size < mem::offset_of!(dl_phdr_info, dlpi_phnum) + mem::size_of::<libc::Elf64_Half>() {
        return 1;
    }
    // SAFETY: `dl_iterate_phdr()` passes a valid info pointer, and `data` is
    // the `CollectState` given to it in `collect_data_segments()`
    let (info, state) = unsafe { (&*info, &mut *(data as *mut CollectState)) };

    // Skip our own module, it holds the registry and heap state, which would
    // otherwise act as roots for every object we track
    if let Some(marker) = state.own_module_marker {
        if module_contains(info, marker) {
            return 0;
        }
    }

    for phdr in phdrs(info) {
        // data could only be found in a loadable and writable segment
        if phdr.p_type != PT_LOAD || phdr.p_flags & PF_W == 0 {
            continue;
        }
        // segment most likely containing .data and/or .bss
        let start = info.dlpi_addr as usize + phdr.p_vaddr as usize;
        let end = start + phdr.p_memsz as usize;
        if let Err(e) = state.segments.push(start, end) {
            state.error = Some(e);
            return 1;
        }
    }
    0
}

/// Enumerate the writable loadable segments (`.data`, `.bss`) of every loaded
/// module. With `skip_own_module`, the module this code lives in is left out.
pub fn collect_data_segments(skip_own_module: bool) -> Result<MemoryRegionSet> {
    let mut state = CollectState {
        segments: MemoryRegionSet::new(),
        own_module_marker: skip_own_module.then(|| &OWN_MODULE_MARKER as *const u8 as usize),
        error: None,
    };
    // SAFETY: the callback only touches `state`, which outlives the call
    let ret = unsafe {
        dl_iterate_phdr(
            Some(data_segments_cb),
            &mut state as *mut CollectState as *mut c_void,
        )
    };
    if let Some(e) = state.error {
        log::error!("[roots] {e}");
        return Err(e);
    }
    if ret != 0 {
        log::warn!("[roots] dl_iterate_phdr stopped early ({ret})");
    }
    Ok(state.segments)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static SOME_GLOBAL: AtomicUsize = AtomicUsize::new(7);

    #[test]
    fn finds_our_own_globals_unless_skipped() {
        let addr = &SOME_GLOBAL as *const AtomicUsize as usize;
        assert_eq!(SOME_GLOBAL.load(Ordering::Relaxed), 7);

        let all = collect_data_segments(false).unwrap();
        assert!(!all.is_empty());
        assert!(all.contains(addr));

        // The test binary *is* our own module
        let others = collect_data_segments(true).unwrap();
        assert!(!others.contains(addr));
        assert!(others.len() < all.len());
    }

    #[test]
    fn region_set_is_bounded() {
        let mut set = MemoryRegionSet::new();
        for i in 0..MAX_SEGMENTS {
            set.push(i * 64, i * 64 + 32).unwrap();
        }
        assert!(matches!(set.push(0, 8), Err(Error::TooManySegments(MAX_SEGMENTS))));
        assert_eq!(set.len(), MAX_SEGMENTS);
    }

    #[test]
    fn region_set_trims_to_words() {
        let mut set = MemoryRegionSet::new();
        set.push(0x1001, 0x100f).unwrap();
        set.push(0x2001, 0x2019).unwrap();
        // The first range has no whole word in it
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0x2008, 0x2018)]);
    }

    #[test]
    fn stack_region_alignment_and_range() {
        let mut stack = StackRegion::EMPTY;
        assert!(!stack.is_set());
        assert_eq!(stack.range(), None);
        stack.set_bottom(0x7fff_0001);
        stack.set_top(0x7ffe_000f);
        assert!(stack.is_set());
        assert_eq!(stack.range(), Some((0x7ffe_0008, 0x7fff_0008)));
        stack.clear();
        assert_eq!(stack, StackRegion::EMPTY);
    }
}
