//! The process-wide allocator symbols, and the constructor and destructor that
//! bring the runtime up and down. Built with the `interpose` feature only.
//!
//! Until the runtime exists, and while it is being created, nothing here can
//! use it: creating it allocates (reading the environment, `dlsym()`). Those
//! allocations come from the [`BootstrapHeap`] instead, recognized by address
//! for the rest of the process so they never reach libc.

use std::{
    ffi::c_void,
    ptr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use libc::size_t;

use super::{fatal, Originals, Runtime};
use crate::{
    alloc::bootstrap::BootstrapHeap,
    arch::mem::stack_pointer,
    config::Config,
    lazy_lock::{LazyLock, LazyLockState},
    logger,
};

/// A lazily created [`Runtime`] and the heap that stands in for it while it
/// is being created
pub struct Hooks {
    runtime: LazyLock<Runtime>,
    bootstrap: Mutex<BootstrapHeap>,
}

impl Hooks {
    pub const fn new(init: fn() -> Runtime) -> Self {
        Self {
            runtime: LazyLock::new(init),
            bootstrap: Mutex::new(BootstrapHeap::new()),
        }
    }

    fn bootstrap(&self) -> MutexGuard<'_, BootstrapHeap> {
        self.bootstrap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initializing(&self) -> bool {
        LazyLock::state(&self.runtime) == LazyLockState::Initializing
    }

    /// The runtime, created on first use
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The runtime, if it is fully created
    pub fn get(&self) -> Option<&Runtime> {
        LazyLock::get(&self.runtime)
    }

    pub fn force(&self) {
        LazyLock::force(&self.runtime);
    }

    pub fn malloc(&self, size: usize) -> *mut c_void {
        if self.initializing() {
            return self.bootstrap().malloc(size).cast();
        }
        self.runtime().malloc(size)
    }

    pub fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
        if self.initializing() {
            return self.bootstrap().calloc(nmemb, size).cast();
        }
        self.runtime().calloc(nmemb, size)
    }

    /// # Safety
    ///
    /// As `realloc(3)`
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        if self.initializing() {
            return unsafe { self.bootstrap().realloc(ptr.cast(), size) }.cast();
        }
        if !ptr.is_null() {
            let old_size = {
                let heap = self.bootstrap();
                // SAFETY: it is one of the bootstrap heap's blocks
                heap.owns(ptr as usize)
                    .then(|| unsafe { heap.size_of(ptr.cast()) })
            };
            if let Some(old_size) = old_size {
                // Bootstrap blocks are never handed to the real allocator,
                // copy it out instead
                let new = self.malloc(size);
                if !new.is_null() {
                    // SAFETY: `new` is a fresh block of `size` bytes, `ptr` a
                    // live one of `old_size`
                    unsafe {
                        ptr::copy_nonoverlapping(
                            ptr.cast::<u8>(),
                            new.cast::<u8>(),
                            old_size.min(size),
                        )
                    };
                }
                return new;
            }
        }
        unsafe { self.runtime().realloc(ptr, size) }
    }

    /// # Safety
    ///
    /// As `free(3)`. `sp` is the stack pointer of the caller's frame.
    pub unsafe fn free(&self, ptr: *mut c_void, sp: usize) {
        {
            let mut heap = self.bootstrap();
            if heap.owns(ptr as usize) {
                if self.initializing() {
                    unsafe { heap.free(ptr.cast()) };
                }
                return;
            }
        }
        if self.initializing() {
            return;
        }
        if let Err(e) = unsafe { self.runtime().try_free(ptr, sp) } {
            fatal(&e)
        }
    }

    /// # Safety
    ///
    /// `ptr` must be `NULL` or a live allocation
    pub unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        if ptr.is_null() {
            return 0;
        }
        {
            let heap = self.bootstrap();
            if heap.owns(ptr as usize) {
                // SAFETY: one of its blocks
                return unsafe { heap.size_of(ptr.cast()) };
            }
        }
        if self.initializing() {
            return 0;
        }
        let rt = self.runtime();
        if rt.owns(ptr as usize) {
            return rt.usable_size(ptr as usize).unwrap_or(0);
        }
        unsafe { (rt.originals().malloc_usable_size)(ptr) }
    }
}

pub static HOOKS: Hooks = Hooks::new(init_runtime);

fn init_runtime() -> Runtime {
    let config = Config::from_env().unwrap_or_else(|e| {
        logger::init(Config::default().log);
        log::warn!("[runtime] {e}, using defaults");
        Config::default()
    });
    logger::init(config.log);

    let originals = Originals::next().unwrap_or_else(|e| fatal(&e));
    match Runtime::new(config.clone(), originals) {
        Ok(runtime) => runtime,
        Err(e) if e.is_fatal() => fatal(&e),
        Err(e) => {
            log::error!("[runtime] safe heap unavailable, forwarding everything: {e}");
            Runtime::passthrough(config, originals)
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    HOOKS.malloc(size)
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
    HOOKS.calloc(nmemb, size)
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    unsafe { HOOKS.realloc(ptr, size) }
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let sp = stack_pointer();
    unsafe { HOOKS.free(ptr, sp) }
}

/// Interposed too, since the answer for a safe-heap block can only come from
/// us
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    unsafe { HOOKS.usable_size(ptr) }
}

extern "C" fn safeheap_init() {
    HOOKS.force();
}

extern "C" fn safeheap_fini() {
    if let Some(rt) = HOOKS.get() {
        if let Err(e) = rt.teardown() {
            log::error!("[runtime] teardown: {e}");
        }
    }
}

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = safeheap_init;

#[used]
#[link_section = ".fini_array"]
static FINI: extern "C" fn() = safeheap_fini;
