//! Using safe blocks from Rust, whether or not the runtime is loaded.
//!
//! The entry points are looked up once in the global scope. When the runtime
//! isn't preloaded they are missing and every call here does nothing, the
//! same way the weak declarations in `safe_blocks.h` behave for C.

use std::{
    cell::Cell,
    ffi::{c_void, CStr},
    mem::{self, MaybeUninit},
    ptr,
};

use once_cell::sync::OnceCell;

type EnterFn = unsafe extern "C" fn(*mut c_void);
type VoidFn = unsafe extern "C" fn();

/// The runtime's C API, each entry `None` if it isn't loaded
#[derive(Debug, Clone, Copy)]
pub struct SafeBlocks {
    enter: Option<EnterFn>,
    exit: Option<VoidFn>,
    set_exempt: Option<VoidFn>,
    unset_exempt: Option<VoidFn>,
    purge: Option<VoidFn>,
    dump: Option<VoidFn>,
}

static SAFE_BLOCKS: OnceCell<SafeBlocks> = OnceCell::new();

/// # Safety
///
/// `F` must be a function pointer type matching `symbol`
unsafe fn lookup<F: Copy>(symbol: &CStr) -> Option<F> {
    // SAFETY: `symbol` is nul-terminated
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) };
    if addr.is_null() {
        return None;
    }
    // SAFETY: the caller promises `F` is the right fn pointer type
    Some(unsafe { mem::transmute_copy::<*mut c_void, F>(&addr) })
}

impl SafeBlocks {
    pub fn get() -> &'static SafeBlocks {
        SAFE_BLOCKS.get_or_init(|| {
            // SAFETY: signatures as in `safe_blocks.h`
            let blocks = unsafe {
                SafeBlocks {
                    enter: lookup(c"enter_safe_block"),
                    exit: lookup(c"exit_safe_block"),
                    set_exempt: lookup(c"set_exempt"),
                    unset_exempt: lookup(c"unset_exempt"),
                    purge: lookup(c"purge_safe_block"),
                    dump: lookup(c"safeheap_dump"),
                }
            };
            log::debug!("[client] runtime available: {}", blocks.is_available());
            blocks
        })
    }

    pub fn is_available(&self) -> bool {
        self.enter.is_some() && self.exit.is_some()
    }

    /// # Safety
    ///
    /// `frame` must be at or above every stack frame that will hold references
    /// to objects allocated in the block
    pub unsafe fn enter(&self, frame: usize) {
        if let Some(enter) = self.enter {
            unsafe { enter(frame as *mut c_void) }
        }
    }

    pub fn exit(&self) {
        call(self.exit)
    }

    pub fn set_exempt(&self) {
        call(self.set_exempt)
    }

    pub fn unset_exempt(&self) {
        call(self.unset_exempt)
    }

    pub fn purge(&self) {
        call(self.purge)
    }

    pub fn dump(&self) {
        call(self.dump)
    }
}

fn call(f: Option<VoidFn>) {
    if let Some(f) = f {
        // SAFETY: takes no arguments, and its preconditions are checked on
        // the other side (fatally)
        unsafe { f() }
    }
}

thread_local! {
    static STACK_BASE: Cell<usize> = const { Cell::new(0) };
}

/// The highest address of the calling thread's stack
fn query_stack_base() -> Option<usize> {
    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
    // SAFETY: `attr` is initialized by `pthread_getattr_np()` before use, and
    // destroyed once we're done with it
    unsafe {
        if libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr()) != 0 {
            return None;
        }
        let mut addr = ptr::null_mut();
        let mut size = 0;
        let ret = libc::pthread_attr_getstack(attr.as_ptr(), &mut addr, &mut size);
        libc::pthread_attr_destroy(attr.as_mut_ptr());
        (ret == 0).then(|| addr as usize + size)
    }
}

/// Where the scanned stack window ends. The whole live stack of the thread,
/// so locals of every caller count as roots, not just the closure's.
fn stack_base(fallback: usize) -> usize {
    STACK_BASE.with(|base| {
        if base.get() == 0 {
            base.set(query_stack_base().unwrap_or(fallback));
        }
        base.get()
    })
}

struct BlockGuard(&'static SafeBlocks);

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.0.exit()
    }
}

struct ExemptGuard(&'static SafeBlocks);

impl Drop for ExemptGuard {
    fn drop(&mut self) {
        self.0.unset_exempt()
    }
}

/// Run `f` inside a safe block
#[inline(never)]
pub fn safe_block<R>(f: impl FnOnce() -> R) -> R {
    let blocks = SafeBlocks::get();
    let anchor = 0usize;
    let frame = stack_base(std::hint::black_box(&anchor) as *const usize as usize);
    // SAFETY: the base of the stack is above every frame
    unsafe { blocks.enter(frame) };
    let _guard = BlockGuard(blocks);
    f()
}

/// Run `f` with allocations bypassing the safe heap. Must be inside a safe
/// block.
pub fn exempt<R>(f: impl FnOnce() -> R) -> R {
    let blocks = SafeBlocks::get();
    blocks.set_exempt();
    let _guard = ExemptGuard(blocks);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_runtime_means_no_ops() {
        let blocks = SafeBlocks::get();
        assert!(!blocks.is_available());
        let v = safe_block(|| exempt(|| vec![1, 2, 3]));
        assert_eq!(v.iter().sum::<i32>(), 6);
        blocks.purge();
        blocks.dump();
    }

    #[test]
    fn stack_base_is_above_our_frame() {
        let local = 0u64;
        let addr = std::hint::black_box(&local) as *const u64 as usize;
        let base = stack_base(0);
        assert!(base > addr);
        // Cached per thread
        assert_eq!(stack_base(1), base);
    }
}
