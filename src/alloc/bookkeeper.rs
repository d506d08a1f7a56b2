//! Bookkeeping for the runtime: the registry of safe-heap objects, and the
//! conservative mark-sweep collector that decides when a freed object may
//! really go.
//!
//! This is called from inside the malloc hooks, which means calling
//! `malloc()` is not allowed. Everything allocates from the metadata heap
//! passed to [`Bookkeeper::init()`] instead, which is never the heap being
//! tracked (otherwise the tracer would be scanning its own tables).
//!
//! Nothing here knows the types of the objects. Any aligned word that falls
//! inside the tracked region and inside a live object counts as a pointer to
//! it. That can keep garbage alive (an integer that happens to look like an
//! address), but it can never free something that is still referenced.

use std::mem;

use crate::{
    alloc::{registry::Registry, region::RegionHeap, worklist::Worklist},
    arch::mem::usize_load_acq,
    config::Config,
    error::{Error, Result},
    os::phdr::{collect_data_segments, StackRegion},
    putln,
    util::{
        assert::word_aligned,
        num::{word_align_down, word_align_up},
    },
};

/// A heap whose objects the bookkeeper can give back.
///
/// # Safety
///
/// `release()` must return the memory of a live object that was registered
/// with exactly that address and size.
pub unsafe trait TrackedHeap {
    /// # Safety
    ///
    /// `addr` must be a live allocation of this heap, requested with `size`
    /// bytes. Nothing may use it afterwards.
    unsafe fn release(&mut self, addr: usize, size: usize);
}

// SAFETY: forwards to dlmalloc's `free()` with the registered size
unsafe impl TrackedHeap for RegionHeap {
    unsafe fn release(&mut self, addr: usize, size: usize) {
        unsafe { self.free(addr as *mut u8, size) }
    }
}

/// When to collect, and what counts as a root
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
    /// Run a collection on every `sweep_every`th free request
    pub sweep_every: u64,
    /// Unreached sweeps a freed object must sit through before it goes
    pub unreachable_threshold: u8,
    /// Scan the writable segments of loaded modules
    pub scan_globals: bool,
    /// ...except the one this code lives in
    pub skip_own_module: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            sweep_every: 1,
            unreachable_threshold: 1,
            scan_globals: true,
            skip_own_module: true,
        }
    }
}

impl From<&Config> for Policy {
    fn from(config: &Config) -> Self {
        Self {
            sweep_every: config.sweep_every.max(1),
            unreachable_threshold: config.unreachable_threshold,
            scan_globals: config.scan_globals,
            skip_own_module: config.skip_own_module,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// `free()` calls routed to us (excluding `NULL`)
    pub free_requests: u64,
    /// Objects reclaimed by a sweep
    pub actual_frees: u64,
    /// Objects reclaimed by a purge
    pub purged: u64,
    /// Collections started
    pub cycles: u64,
}

/// What one collection did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Objects found reachable
    pub marked: usize,
    /// Objects given back to the heap
    pub reclaimed: usize,
    /// Objects unreached but kept, not requested or still within hysteresis
    pub retained: usize,
}

pub struct Bookkeeper {
    meta: RegionHeap,
    registry: Registry,
    worklist: Worklist,
    /// Tracked region, for the cheap "could this be a pointer?" test
    heap_addr: usize,
    heap_size: usize,
    policy: Policy,
    stats: Stats,
    /// Free requests seen, for `Policy::sweep_every`
    requests: u64,
}

impl Bookkeeper {
    /// Set up the registry in `meta`, tracking objects of the heap at
    /// `[heap_addr, heap_addr + heap_size)`
    pub fn init(
        mut meta: RegionHeap,
        heap_addr: usize,
        heap_size: usize,
        policy: Policy,
    ) -> Result<Self> {
        let registry = Registry::init(&mut meta).inspect_err(|e| {
            log::error!("[bookkeeper] init: {e}");
        })?;
        let worklist = Worklist::init(&mut meta)?;
        Ok(Self {
            meta,
            registry,
            worklist,
            heap_addr,
            heap_size,
            policy,
            stats: Stats::default(),
            requests: 0,
        })
    }

    /// Release the tables and unmap the metadata heap
    pub fn exit(self) -> Result<()> {
        let Self {
            mut meta,
            mut registry,
            mut worklist,
            ..
        } = self;
        registry.release(&mut meta);
        worklist.release(&mut meta);
        meta.into_region().unmap()
    }

    pub const fn stats(&self) -> Stats {
        self.stats
    }

    /// Number of tracked objects
    pub const fn len(&self) -> usize {
        self.registry.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.registry.capacity()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_tracked(&self, addr: usize) -> bool {
        self.registry.find_exact(addr).is_some()
    }

    /// Registered size of the object at `addr`
    pub fn size_of(&self, addr: usize) -> Option<usize> {
        self.registry
            .find_exact(addr)
            .map(|slot| self.registry.get(slot).size)
    }

    pub fn is_requested_free(&self, addr: usize) -> bool {
        self.registry
            .find_exact(addr)
            .is_some_and(|slot| self.registry.get(slot).requested_free)
    }

    /// Start tracking an object
    pub fn add(&mut self, addr: usize, size: usize) -> Result<()> {
        self.registry
            .insert(&mut self.meta, addr, size)
            .inspect_err(|e| log::error!("[bookkeeper] add({addr:#x}, {size}): {e}"))?;
        log::trace!("[bookkeeper] add({addr:#x}, {size})");
        Ok(())
    }

    /// Stop tracking an object, without touching its memory
    pub fn delete_entry(&mut self, addr: usize) -> Result<()> {
        if self.registry.remove(addr) {
            return Ok(());
        }
        let e = Error::NotFound(addr);
        log::error!("[bookkeeper] delete_entry: {e}");
        Err(e)
    }

    /// Mark `addr` as freed by the program, without collecting. `false` when
    /// nothing is tracked there.
    pub fn defer_free(&mut self, addr: usize) -> bool {
        match self.registry.find_exact(addr) {
            Some(slot) => {
                self.registry.get_mut(slot).requested_free = true;
                true
            }
            None => false,
        }
    }

    /// The program called `free(addr)`. Marks the object, then (every
    /// `sweep_every` requests) runs a collection with `stack` as the stack
    /// root. Freeing `NULL`, or an address we don't track, is not an error,
    /// same as it isn't for `free()`.
    pub fn request_free<H>(
        &mut self,
        addr: usize,
        stack: &StackRegion,
        heap: &mut H,
    ) -> Result<Option<CycleReport>>
    where
        H: TrackedHeap,
    {
        // for compatibility with actual free, see `man 3 free`
        if addr == 0 {
            return Ok(None);
        }
        self.stats.free_requests += 1;
        if !self.defer_free(addr) {
            log::debug!("[bookkeeper] no object stored at addr: {addr:#x}");
        }

        let requests = self.requests;
        self.requests += 1;
        if requests % self.policy.sweep_every != 0 {
            return Ok(None);
        }
        self.collect(stack, heap).map(Some)
    }

    /// One full trace-and-sweep. If the roots can't be enumerated the cycle
    /// is dropped and nothing is freed: sweeping after a partial trace would
    /// free live objects.
    pub fn collect<H>(&mut self, stack: &StackRegion, heap: &mut H) -> Result<CycleReport>
    where
        H: TrackedHeap,
    {
        self.stats.cycles += 1;
        if let Err(e) = self.trace_roots(stack) {
            log::warn!("[bookkeeper] collection abandoned: {e}");
            self.clear_marks();
            return Err(e);
        }
        let report = self.sweep(heap);
        log::debug!(
            "[bookkeeper] cycle {}: marked={} reclaimed={} retained={}",
            self.stats.cycles,
            report.marked,
            report.reclaimed,
            report.retained
        );
        Ok(report)
    }

    /// Give back every tracked object, reachable or not
    pub fn purge_all<H>(&mut self, heap: &mut H)
    where
        H: TrackedHeap,
    {
        self.worklist.clear();
        for slot in 0..self.registry.high_water() {
            let rec = *self.registry.get(slot);
            if rec.is_empty() {
                continue;
            }
            // SAFETY: registered with this address and size, and not yet
            // released (released objects leave the registry)
            unsafe { heap.release(rec.address, rec.size) };
            self.registry.remove_slot(slot);
            self.stats.purged += 1;
        }
        log::debug!("[bookkeeper] purged, {} total", self.stats.purged);
    }

    fn in_heap(&self, value: usize) -> bool {
        value >= self.heap_addr && value <= self.heap_addr + self.heap_size
    }

    /// Scan the words of `[start, end)` (both word-aligned), marking and
    /// queueing every unmarked object one of them points into
    fn mark_from_region(&mut self, start: usize, end: usize) -> Result<()> {
        log::trace!("[bookkeeper] REGION: {start:#x} - {end:#x}");
        debug_assert!(word_aligned(start));
        let mut cur = start;
        while cur < end {
            // SAFETY: every region we scan is readable: module data
            // segments, the live part of our own stack, or a live safe-heap
            // object (the caller is in a safe block, so has access)
            let addr = unsafe { usize_load_acq(cur as *const usize) };
            cur += mem::size_of::<usize>();
            // mark iff addr belongs to a heap object
            if !self.in_heap(addr) {
                continue;
            }
            for pos in self.registry.containing(addr) {
                let slot = self.registry.slot_at(pos);
                let rec = self.registry.get_mut(slot);
                if rec.marked {
                    continue;
                }
                rec.marked = true;
                self.worklist.push(&mut self.meta, slot)?;
            }
        }
        Ok(())
    }

    /// Drain the worklist, scanning each marked object's payload in turn
    fn mark(&mut self) -> Result<()> {
        while let Some(slot) = self.worklist.pop() {
            let rec = *self.registry.get(slot);
            let start = word_align_up(rec.address);
            let end = word_align_down(rec.end());
            self.mark_from_region(start, end)?;
        }
        Ok(())
    }

    fn trace_roots(&mut self, stack: &StackRegion) -> Result<()> {
        if self.policy.scan_globals {
            let segments = collect_data_segments(self.policy.skip_own_module)?;
            for (start, end) in segments.iter() {
                self.mark_from_region(start, end)?;
            }
        }
        if let Some((top, bottom)) = stack.range() {
            log::trace!("[bookkeeper] SAFE STACK SECTION: {top:#x} - {bottom:#x}");
            self.mark_from_region(top, bottom)?;
        }
        self.mark()
    }

    fn clear_marks(&mut self) {
        self.worklist.clear();
        for slot in 0..self.registry.high_water() {
            self.registry.get_mut(slot).marked = false;
        }
    }

    fn sweep<H>(&mut self, heap: &mut H) -> CycleReport
    where
        H: TrackedHeap,
    {
        let mut report = CycleReport::default();
        for slot in 0..self.registry.high_water() {
            let rec = self.registry.get_mut(slot);
            if rec.is_empty() {
                continue;
            }
            if rec.marked {
                rec.marked = false;
                report.marked += 1;
                continue;
            }
            if !rec.requested_free || rec.unreachable_cnt < self.policy.unreachable_threshold {
                rec.unreachable_cnt = rec.unreachable_cnt.saturating_add(1);
                report.retained += 1;
                continue;
            }

            // current object is garbage, and was requested to be freed
            let (address, size) = (rec.address, rec.size);
            // SAFETY: registered with this address and size, and unreached,
            // so nothing we can see still points at it
            unsafe { heap.release(address, size) };
            self.registry.remove_slot(slot);
            self.stats.actual_frees += 1;
            report.reclaimed += 1;
        }
        report
    }

    /// Print the counters and every tracked object to stderr. Doesn't
    /// allocate, so it is safe to call from anywhere.
    pub fn dump(&self) {
        putln!("bookkeeper_dump:");
        putln!("free requests count: {}", self.stats.free_requests);
        putln!("actual frees count: {}", self.stats.actual_frees);
        putln!("addr:\t\tsize:");
        for slot in self.registry.iter_slots() {
            let rec = self.registry.get(slot);
            let tag = if rec.marked { "TAGGED" } else { "NOT_TAGGED" };
            putln!("{:#x}\t{}\t{}", rec.address, rec.size, tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A bookkeeper over a plain region heap, with only the stack window as a
    /// root so that each test decides exactly what is reachable
    fn setup() -> (RegionHeap, Bookkeeper) {
        let heap = RegionHeap::map(16 << 20, 0).unwrap();
        let meta = RegionHeap::map(16 << 20, 0).unwrap();
        let policy = Policy {
            scan_globals: false,
            ..Policy::default()
        };
        let bk = Bookkeeper::init(meta, heap.base(), heap.size(), policy).unwrap();
        (heap, bk)
    }

    fn alloc(heap: &mut RegionHeap, bk: &mut Bookkeeper, size: usize) -> usize {
        let p = heap.malloc(size) as usize;
        bk.add(p, size).unwrap();
        p
    }

    /// A fake stack: `roots` is the whole scanned window
    fn window(roots: &[usize]) -> StackRegion {
        let start = roots.as_ptr() as usize;
        StackRegion::new(start, start + mem::size_of_val(roots))
    }

    #[test]
    fn reachable_objects_are_never_reclaimed() {
        let (mut heap, mut bk) = setup();
        let a = alloc(&mut heap, &mut bk, 32);
        unsafe { (a as *mut u64).write(0xabcd) };
        let roots = [a];
        bk.request_free(a, &window(&roots), &mut heap).unwrap();
        for _ in 0..8 {
            let report = bk.collect(&window(&roots), &mut heap).unwrap();
            assert_eq!(report.reclaimed, 0);
        }
        assert!(bk.is_tracked(a));
        assert_eq!(unsafe { (a as *const u64).read() }, 0xabcd);
        // Another allocation can't land on top of it
        let b = alloc(&mut heap, &mut bk, 32);
        assert_ne!(a, b);
    }

    #[test]
    fn unreachable_freed_objects_go_after_the_hysteresis() {
        let (mut heap, mut bk) = setup();
        let a = alloc(&mut heap, &mut bk, 16);
        let roots = [0usize; 4];

        // First cycle: unreached, but this is its first strike
        let report = bk.request_free(a, &window(&roots), &mut heap).unwrap().unwrap();
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.retained, 1);
        assert!(bk.is_tracked(a));

        let report = bk.collect(&window(&roots), &mut heap).unwrap();
        assert_eq!(report.reclaimed, 1);
        assert!(!bk.is_tracked(a));
        assert_eq!(bk.stats().actual_frees, 1);
        assert_eq!(bk.stats().free_requests, 1);
    }

    #[test]
    fn objects_unreached_before_the_free_go_on_the_first_cycle_after_it() {
        let (mut heap, mut bk) = setup();
        let a = alloc(&mut heap, &mut bk, 16);
        let roots = [0usize; 2];
        bk.collect(&window(&roots), &mut heap).unwrap();
        assert!(bk.is_tracked(a));
        let report = bk.request_free(a, &window(&roots), &mut heap).unwrap().unwrap();
        assert_eq!(report.reclaimed, 1);
    }

    #[test]
    fn reachability_is_transitive_through_payloads() {
        let (mut heap, mut bk) = setup();
        // root -> a -> b -> c, and c -> a closes a cycle
        let a = alloc(&mut heap, &mut bk, 16);
        let b = alloc(&mut heap, &mut bk, 24);
        let c = alloc(&mut heap, &mut bk, 8);
        unsafe {
            (a as *mut usize).write(b);
            // interior pointer, still keeps `c` alive
            (b as *mut usize).add(2).write(c + 4);
            (c as *mut usize).write(a);
        }
        for p in [a, b, c] {
            bk.defer_free(p);
        }
        let roots = [a];
        for _ in 0..3 {
            let report = bk.collect(&window(&roots), &mut heap).unwrap();
            assert_eq!(report.marked, 3);
            assert_eq!(report.reclaimed, 0);
        }

        // Drop the root: the whole cycle goes (strike one, then reclaimed)
        let roots = [0usize];
        bk.collect(&window(&roots), &mut heap).unwrap();
        let report = bk.collect(&window(&roots), &mut heap).unwrap();
        assert_eq!(report.reclaimed, 3);
        assert!(bk.is_empty());
    }

    #[test]
    fn one_past_the_end_pointers_count() {
        let (mut heap, mut bk) = setup();
        let a = alloc(&mut heap, &mut bk, 16);
        bk.defer_free(a);
        let roots = [a + 16];
        bk.collect(&window(&roots), &mut heap).unwrap();
        bk.collect(&window(&roots), &mut heap).unwrap();
        assert!(bk.is_tracked(a));
    }

    #[test]
    fn sweeps_leave_no_tags_and_are_idempotent() {
        let (mut heap, mut bk) = setup();
        let a = alloc(&mut heap, &mut bk, 16);
        let b = alloc(&mut heap, &mut bk, 16);
        unsafe { (a as *mut usize).write(b) };
        let roots = [a];
        bk.collect(&window(&roots), &mut heap).unwrap();
        let snapshot = |bk: &Bookkeeper| {
            bk.registry()
                .iter_slots()
                .map(|s| *bk.registry().get(s))
                .collect::<Vec<_>>()
        };
        let first = snapshot(&bk);
        assert!(first.iter().all(|rec| !rec.marked));
        bk.collect(&window(&roots), &mut heap).unwrap();
        assert_eq!(snapshot(&bk), first);
    }

    #[test]
    fn unknown_addresses_are_tolerated() {
        let (mut heap, mut bk) = setup();
        let roots = [0usize];
        assert_eq!(bk.request_free(0, &window(&roots), &mut heap).unwrap(), None);
        assert_eq!(bk.stats().free_requests, 0);
        bk.request_free(0xdead_0000, &window(&roots), &mut heap).unwrap();
        assert_eq!(bk.stats().free_requests, 1);
        assert!(matches!(bk.delete_entry(0xdead_0000), Err(Error::NotFound(0xdead_0000))));
    }

    #[test]
    fn sweep_every_batches_collections() {
        let (mut heap, mut bk) = setup();
        bk.policy.sweep_every = 3;
        let roots = [0usize];
        let ptrs: Vec<_> = (0..4).map(|_| alloc(&mut heap, &mut bk, 8)).collect();
        let ran: Vec<_> = ptrs
            .iter()
            .map(|&p| bk.request_free(p, &window(&roots), &mut heap).unwrap().is_some())
            .collect();
        assert_eq!(ran, vec![true, false, false, true]);
        assert_eq!(bk.stats().cycles, 2);
    }

    #[test]
    fn purge_reclaims_everything_regardless_of_reachability() {
        let (mut heap, mut bk) = setup();
        let a = alloc(&mut heap, &mut bk, 64);
        let _b = alloc(&mut heap, &mut bk, 64);
        let roots = [a];
        bk.collect(&window(&roots), &mut heap).unwrap();
        bk.purge_all(&mut heap);
        assert!(bk.is_empty());
        assert_eq!(bk.stats().purged, 2);
        assert_eq!(bk.stats().actual_frees, 0);
    }

    #[test]
    fn slot_is_reused_after_reclamation() {
        use crate::alloc::registry::INIT_LENGTH;

        let (mut heap, mut bk) = setup();
        let roots = [0usize];
        let objects: Vec<usize> = (0..INIT_LENGTH)
            .map(|_| alloc(&mut heap, &mut bk, 16))
            .collect();
        assert_eq!(bk.capacity(), INIT_LENGTH);

        // Full: the next record can only go in a hole
        let victim = objects[INIT_LENGTH / 2];
        let slot = bk.registry().find_exact(victim).unwrap();
        bk.defer_free(victim);
        bk.collect(&window(&roots), &mut heap).unwrap();
        bk.collect(&window(&roots), &mut heap).unwrap();
        assert!(!bk.is_tracked(victim));
        assert_eq!(bk.len(), INIT_LENGTH - 1);

        let b = alloc(&mut heap, &mut bk, 24);
        assert_eq!(bk.registry().find_exact(b), Some(slot));
        assert_eq!(bk.capacity(), INIT_LENGTH);
        assert!(objects.iter().all(|&o| o == victim || bk.is_tracked(o)));
    }

    #[test]
    fn globals_are_roots() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static GLOBAL_REF: AtomicUsize = AtomicUsize::new(0);

        let heap = RegionHeap::map(16 << 20, 0).unwrap();
        let meta = RegionHeap::map(16 << 20, 0).unwrap();
        let policy = Policy {
            skip_own_module: false,
            ..Policy::default()
        };
        let (mut heap, mut bk) = (
            heap,
            Bookkeeper::init(meta, 0, 0, policy).unwrap(),
        );
        bk.heap_addr = heap.base();
        bk.heap_size = heap.size();

        let a = alloc(&mut heap, &mut bk, 16);
        GLOBAL_REF.store(a, Ordering::SeqCst);
        bk.defer_free(a);
        for _ in 0..3 {
            bk.collect(&StackRegion::EMPTY, &mut heap).unwrap();
        }
        assert!(bk.is_tracked(a));

        GLOBAL_REF.store(0, Ordering::SeqCst);
        bk.collect(&StackRegion::EMPTY, &mut heap).unwrap();
        bk.collect(&StackRegion::EMPTY, &mut heap).unwrap();
        assert!(!bk.is_tracked(a));
    }
}
