//! The policy layer between the program and its allocator.
//!
//! Every `malloc()`, `calloc()`, `realloc()` and `free()` in the process ends
//! up in a [`Runtime`] method, which decides where it goes:
//!
//! - outside a safe block: straight to the original allocator, with the safe
//!   heap forced inaccessible around the call
//! - inside a block, exempt: straight to the original allocator
//! - inside a block: into the safe heap, registered with the bookkeeper. A
//!   `free()` only asks for the object to go, and runs a collection.
//!
//! Whatever the context, a pointer is only ever released by the allocator it
//! came from. Safe-heap memory never reaches libc, libc memory never reaches
//! the safe heap.
//!
//! The decisions are made against per-thread state ([`thread`]), the heap and
//! bookkeeper sit behind one lock. Contract violations are fatal, see
//! [`fatal()`].

pub mod symbols;
pub mod thread;

#[cfg(feature = "interpose")]
pub mod hooks;

use std::{
    ffi::c_void,
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
};

pub use symbols::Originals;

use crate::{
    alloc::{
        bookkeeper::{Bookkeeper, Policy, Stats},
        region::RegionHeap,
        safe_heap::SafeHeap,
    },
    arch::mem::stack_pointer,
    config::Config,
    error::{Error, Result, Violation},
    os::{
        phdr::StackRegion,
        pkey::{KeyHandle, Permission},
    },
    putln,
};

/// Report an unrecoverable error and kill the process. Every fatal path in the
/// runtime ends here.
#[cold]
#[inline(never)]
pub fn fatal(err: &Error) -> ! {
    putln!("ERROR: safeheap: {err}");
    std::process::abort()
}

fn or_fatal<T>(res: Result<T>) -> T {
    res.unwrap_or_else(|e| fatal(&e))
}

fn set_errno(code: i32) {
    // SAFETY: always valid for the calling thread
    unsafe { *libc::__errno_location() = code };
}

/// Allocation failed: `NULL` and `ENOMEM`, as libc would
fn out_of_memory() -> *mut c_void {
    set_errno(libc::ENOMEM);
    ptr::null_mut()
}

/// The safe heap and its book, always used together and under one lock
struct Engine {
    heap: SafeHeap,
    book: Bookkeeper,
}

impl Engine {
    /// Start tracking a fresh safe-heap block, or give it back if we can't
    fn register(&mut self, ptr: *mut u8, size: usize) -> *mut c_void {
        if ptr.is_null() {
            log::warn!("[runtime] safe heap exhausted ({size} bytes)");
            return out_of_memory();
        }
        debug_assert!(self.heap.contains(ptr as usize));
        if let Err(e) = self.book.add(ptr as usize, size) {
            log::error!("[runtime] unable to track {ptr:p}: {e}");
            // SAFETY: just allocated with `size` bytes, nobody has seen it
            unsafe { self.heap.free(ptr, size) };
            return out_of_memory();
        }
        ptr.cast()
    }

    fn malloc(&mut self, size: usize) -> *mut c_void {
        let ptr = self.heap.malloc(size);
        self.register(ptr, size)
    }

    fn calloc(&mut self, nmemb: usize, size: usize) -> *mut c_void {
        let ptr = self.heap.calloc(nmemb, size);
        // A non-null block means the product did not overflow
        self.register(ptr, nmemb.wrapping_mul(size))
    }

    /// Move a tracked object into a new block. The old one is only marked as
    /// freed, so it sits in quarantine like any other freed object, and its
    /// record leaves the book when a sweep reclaims it.
    ///
    /// # Safety
    ///
    /// The calling thread must have read/write access to the safe heap
    unsafe fn realloc(&mut self, addr: usize, size: usize) -> *mut c_void {
        let Some(old_size) = self.book.size_of(addr) else {
            log::error!("[runtime] realloc: {}", Error::NotFound(addr));
            return out_of_memory();
        };
        let new = self.malloc(size);
        if new.is_null() {
            return new;
        }
        // SAFETY: both are live safe-heap blocks of at least that many bytes,
        // and a fresh block never overlaps a live one
        unsafe {
            ptr::copy_nonoverlapping(addr as *const u8, new.cast::<u8>(), old_size.min(size))
        };
        self.book.defer_free(addr);
        new
    }

    fn request_free(&mut self, addr: usize, stack: &StackRegion) {
        // A failed collection is already logged, and freed nothing
        if let Ok(Some(report)) = self.book.request_free(addr, stack, &mut self.heap) {
            log::trace!("[runtime] free({addr:#x}): {report:?}");
        }
    }
}

pub struct Runtime {
    originals: Originals,
    config: Config,
    /// The safe heap's key, for flipping our own thread's access without
    /// taking the lock
    key: Option<KeyHandle>,
    heap_base: usize,
    heap_size: usize,
    /// Cleared by [`Runtime::teardown()`]
    live: AtomicBool,
    engine: Mutex<Option<Engine>>,
}

impl Runtime {
    /// Create the safe heap and the bookkeeper. The calling thread leaves
    /// with no access to the heap.
    pub fn new(config: Config, originals: Originals) -> Result<Self> {
        let heap = SafeHeap::create(&config)?;
        // set safe context during init
        heap.set_permission(Permission::ReadWrite)?;
        let meta = RegionHeap::map(config.meta_size, 0).inspect_err(|e| {
            log::error!("[runtime] metadata heap: {e}");
        })?;
        let book = Bookkeeper::init(meta, heap.base(), heap.size(), Policy::from(&config))?;
        // init done, exiting safe context
        heap.set_permission(Permission::NoAccess)?;

        log::info!(
            "[runtime] safe heap at {:#x} ({} bytes), key {} ({:?})",
            heap.base(),
            heap.size(),
            heap.key().id(),
            heap.key().isolation()
        );
        Ok(Self {
            originals,
            key: Some(heap.key().handle()),
            heap_base: heap.base(),
            heap_size: heap.size(),
            live: AtomicBool::new(true),
            engine: Mutex::new(Some(Engine { heap, book })),
            config,
        })
    }

    /// A runtime with no safe heap, forwarding everything. What the process
    /// gets when the safe heap can't be set up.
    pub fn passthrough(config: Config, originals: Originals) -> Self {
        Self {
            originals,
            config,
            key: None,
            heap_base: 0,
            heap_size: 0,
            live: AtomicBool::new(false),
            engine: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn originals(&self) -> &Originals {
        &self.originals
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Whether `addr` is in the safe heap's region. Stays true for the old
    /// region after teardown, so late frees of it are still recognized.
    pub fn owns(&self, addr: usize) -> bool {
        addr >= self.heap_base && addr < self.heap_base + self.heap_size
    }

    /// The calling thread's access to the safe heap
    pub fn permission(&self) -> Option<Permission> {
        self.live_key().map(|key| key.permission())
    }

    pub fn is_tracked(&self, addr: usize) -> bool {
        self.with_engine(|e| e.book.is_tracked(addr)).unwrap_or(false)
    }

    pub fn is_requested_free(&self, addr: usize) -> bool {
        self.with_engine(|e| e.book.is_requested_free(addr))
            .unwrap_or(false)
    }

    /// Registered size of a tracked safe-heap object
    pub fn usable_size(&self, addr: usize) -> Option<usize> {
        self.with_engine(|e| e.book.size_of(addr)).flatten()
    }

    pub fn stats(&self) -> Option<Stats> {
        self.with_engine(|e| e.book.stats())
    }

    /// Number of objects in the book
    pub fn tracked(&self) -> usize {
        self.with_engine(|e| e.book.len()).unwrap_or(0)
    }

    fn live_key(&self) -> Option<KeyHandle> {
        self.key.filter(|_| self.is_live())
    }

    fn with_engine<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> Option<R> {
        let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        engine.as_mut().map(f)
    }

    fn set_permission(&self, perm: Permission) -> Result<()> {
        match self.live_key() {
            Some(key) => key.set_permission(perm),
            None => Ok(()),
        }
    }

    /// Inside a block we must have full access, and a stack to scan
    fn check_in_block(&self) -> Result<()> {
        let Some(key) = self.live_key() else {
            return Ok(());
        };
        let perm = key.permission();
        if perm != Permission::ReadWrite {
            return Err(Violation::MissingPermission(perm).into());
        }
        if !thread::safe_stack().is_set() {
            return Err(Violation::StackBottomUnset.into());
        }
        Ok(())
    }

    /// Outside a block we must not have write access
    fn check_outside(&self) -> Result<()> {
        match self.live_key() {
            Some(key) if key.permission() == Permission::ReadWrite => {
                Err(Violation::PermissionLeaked.into())
            }
            _ => Ok(()),
        }
    }

    /// Forward a call made outside any safe block, with the safe heap locked
    /// away before and after
    fn outside<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.check_outside()?;
        self.set_permission(Permission::NoAccess)?;
        let ret = f();
        self.set_permission(Permission::NoAccess)?;
        Ok(ret)
    }

    pub fn try_malloc(&self, size: usize) -> Result<*mut c_void> {
        if !thread::in_safe_block() {
            // SAFETY: the original allocator takes any size
            return self.outside(|| unsafe { (self.originals.malloc)(size) });
        }
        self.check_in_block()?;
        if thread::is_exempt() {
            // user requested for allocs to bypass the safe heap
            return Ok(unsafe { (self.originals.malloc)(size) });
        }
        Ok(self
            .with_engine(|e| e.malloc(size))
            .unwrap_or_else(|| unsafe { (self.originals.malloc)(size) }))
    }

    pub fn try_calloc(&self, nmemb: usize, size: usize) -> Result<*mut c_void> {
        if !thread::in_safe_block() {
            // SAFETY: as `try_malloc()`
            return self.outside(|| unsafe { (self.originals.calloc)(nmemb, size) });
        }
        self.check_in_block()?;
        if thread::is_exempt() {
            return Ok(unsafe { (self.originals.calloc)(nmemb, size) });
        }
        Ok(self
            .with_engine(|e| e.calloc(nmemb, size))
            .unwrap_or_else(|| unsafe { (self.originals.calloc)(nmemb, size) }))
    }

    /// # Safety
    ///
    /// `ptr` must be `NULL` or a live allocation, as for `realloc(3)`
    pub unsafe fn try_realloc(&self, ptr: *mut c_void, size: usize) -> Result<*mut c_void> {
        if ptr.is_null() {
            return self.try_malloc(size);
        }
        let addr = ptr as usize;
        if !thread::in_safe_block() {
            if self.owns(addr) {
                return unsafe { self.realloc_out_of_safe_heap(addr, size) };
            }
            return self.outside(|| unsafe { (self.originals.realloc)(ptr, size) });
        }
        self.check_in_block()?;

        if !self.owns(addr) {
            if thread::is_exempt() || size == 0 || !self.is_live() {
                return Ok(unsafe { (self.originals.realloc)(ptr, size) });
            }
            return Ok(unsafe { self.realloc_into_safe_heap(ptr, size) });
        }

        if size == 0 {
            // realloc(ptr, 0) frees
            self.with_engine(|e| e.book.defer_free(addr));
            return Ok(ptr::null_mut());
        }
        // SAFETY: in a safe block, and the check above confirmed access
        Ok(self
            .with_engine(|e| unsafe { e.realloc(addr, size) })
            .unwrap_or_else(out_of_memory))
    }

    /// A block from the original allocator, resized into the safe heap
    unsafe fn realloc_into_safe_heap(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        let Some(new) = self.with_engine(|e| e.malloc(size)) else {
            return unsafe { (self.originals.realloc)(ptr, size) };
        };
        if new.is_null() {
            return new;
        }
        unsafe {
            let old_size = (self.originals.malloc_usable_size)(ptr);
            ptr::copy_nonoverlapping(ptr.cast::<u8>(), new.cast::<u8>(), old_size.min(size));
            (self.originals.free)(ptr);
        }
        new
    }

    /// A safe-heap object resized outside any block. Its contents move to the
    /// original allocator, the old object is left to the collector.
    unsafe fn realloc_out_of_safe_heap(&self, addr: usize, size: usize) -> Result<*mut c_void> {
        self.check_outside()?;
        let Some(old_size) = self.with_engine(|e| e.book.size_of(addr)).flatten() else {
            log::error!("[runtime] realloc: {}", Error::NotFound(addr));
            return Ok(out_of_memory());
        };
        let new = if size == 0 {
            ptr::null_mut()
        } else {
            // SAFETY: as `try_malloc()`
            unsafe { (self.originals.malloc)(size) }
        };
        if size != 0 && new.is_null() {
            return Ok(new);
        }
        if !new.is_null() {
            // Only this thread, and only for the copy
            self.set_permission(Permission::ReadWrite)?;
            // SAFETY: the object has `old_size` bytes, the new block `size`,
            // and they are in different heaps
            unsafe {
                ptr::copy_nonoverlapping(addr as *const u8, new.cast::<u8>(), old_size.min(size))
            };
        }
        self.set_permission(Permission::NoAccess)?;
        self.with_engine(|e| e.book.defer_free(addr));
        Ok(new)
    }

    /// # Safety
    ///
    /// `ptr` must be `NULL` or a live allocation, as for `free(3)`. `sp` is
    /// the stack pointer of the caller's frame.
    pub unsafe fn try_free(&self, ptr: *mut c_void, sp: usize) -> Result<()> {
        // for compatibility with actual free, see `man 3 free`
        if ptr.is_null() {
            return Ok(());
        }
        let addr = ptr as usize;
        if !thread::in_safe_block() {
            self.check_outside()?;
            if self.owns(addr) {
                // Never libc's to free. Quarantined until a block collects it.
                if self.with_engine(|e| e.book.defer_free(addr)) == Some(false) {
                    log::debug!(
                        "[runtime] free outside block, no object stored at addr: {addr:#x}"
                    );
                }
                return Ok(());
            }
            return self.outside(|| unsafe { (self.originals.free)(ptr) });
        }
        self.check_in_block()?;
        if !self.owns(addr) {
            // exempt, or allocated before the block was entered
            unsafe { (self.originals.free)(ptr) };
            return Ok(());
        }
        let stack = thread::capture_stack_top(sp);
        self.with_engine(|e| e.request_free(addr, &stack));
        Ok(())
    }

    pub fn try_enter_safe_block(&self, frame: usize) -> Result<()> {
        if thread::enter(frame) {
            self.set_permission(Permission::ReadWrite)?;
            log::trace!("[runtime] enter safe block, bottom {:#x}", thread::safe_stack().bottom);
        }
        self.check_in_block()
    }

    pub fn try_exit_safe_block(&self) -> Result<()> {
        match thread::exit() {
            Some(true) => {
                log::trace!("[runtime] exit safe block");
                self.set_permission(Permission::NoAccess)
            }
            Some(false) => Ok(()),
            None => {
                log::warn!("[runtime] exit_safe_block outside any safe block");
                Ok(())
            }
        }
    }

    pub fn try_set_exempt(&self, exempt: bool) -> Result<()> {
        if !thread::in_safe_block() {
            return Err(Violation::ExemptOutsideBlock.into());
        }
        thread::set_exempt(exempt);
        Ok(())
    }

    pub fn try_purge_safe_block(&self) -> Result<()> {
        if !thread::in_safe_block() {
            return Err(Violation::PurgeOutsideBlock.into());
        }
        self.check_in_block()?;
        self.with_engine(|e| e.book.purge_all(&mut e.heap));
        Ok(())
    }

    pub fn malloc(&self, size: usize) -> *mut c_void {
        or_fatal(self.try_malloc(size))
    }

    pub fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
        or_fatal(self.try_calloc(nmemb, size))
    }

    /// # Safety
    ///
    /// See [`Runtime::try_realloc()`]
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        or_fatal(unsafe { self.try_realloc(ptr, size) })
    }

    /// # Safety
    ///
    /// See [`Runtime::try_free()`]
    #[inline(always)]
    pub unsafe fn free(&self, ptr: *mut c_void) {
        let sp = stack_pointer();
        or_fatal(unsafe { self.try_free(ptr, sp) })
    }

    /// Start a safe block. `frame` is the caller's frame address, everything
    /// on the stack between it and a later `free()` is scanned for roots.
    pub fn enter_safe_block(&self, frame: usize) {
        or_fatal(self.try_enter_safe_block(frame))
    }

    pub fn exit_safe_block(&self) {
        or_fatal(self.try_exit_safe_block())
    }

    pub fn set_exempt(&self) {
        or_fatal(self.try_set_exempt(true))
    }

    pub fn unset_exempt(&self) {
        or_fatal(self.try_set_exempt(false))
    }

    /// Reclaim every safe-heap object, reachable or not
    pub fn purge_safe_block(&self) {
        or_fatal(self.try_purge_safe_block())
    }

    pub fn dump(&self) {
        if self.with_engine(|e| e.book.dump()).is_none() {
            putln!("safeheap: no safe heap");
        }
    }

    /// Release everything. From here on every call is forwarded to the
    /// original allocator, and frees of old safe-heap pointers are ignored.
    pub fn teardown(&self) -> Result<()> {
        let Some(engine) = self.engine.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Ok(());
        };
        let Engine { heap, book } = engine;
        // since we're exiting, enable perms to clean up without issues
        if let Err(e) = heap.set_permission(Permission::ReadWrite) {
            log::error!("[runtime] teardown: {e}");
        }
        self.live.store(false, Ordering::Release);
        if self.config.dump_on_exit {
            book.dump();
        }
        let stats = book.stats();
        log::info!(
            "[runtime] exiting: {} free requests, {} actual frees, {} purged, {} cycles",
            stats.free_requests,
            stats.actual_frees,
            stats.purged,
            stats.cycles
        );
        let book_res = book.exit().inspect_err(|e| log::error!("[runtime] bookkeeper exit: {e}"));
        let heap_res = heap
            .destroy()
            .inspect_err(|e| log::error!("[runtime] destroy safe heap: {e}"));
        book_res.and(heap_res)
    }
}
