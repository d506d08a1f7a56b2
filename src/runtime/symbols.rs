//! The allocator we stand in front of.

use std::{
    ffi::{c_void, CStr},
    mem,
};

use libc::size_t;

use crate::error::{Error, Result};

pub type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type UsableSizeFn = unsafe extern "C" fn(*mut c_void) -> size_t;

/// The original `malloc()` family. Resolved once and never changed after.
#[derive(Clone, Copy)]
pub struct Originals {
    pub malloc: MallocFn,
    pub calloc: CallocFn,
    pub realloc: ReallocFn,
    pub free: FreeFn,
    pub malloc_usable_size: UsableSizeFn,
}

/// # Safety
///
/// `F` must be a function pointer type matching the C signature of `symbol`
unsafe fn next_symbol<F: Copy>(symbol: &'static CStr) -> Result<F> {
    // SAFETY: `symbol` is nul-terminated, and `RTLD_NEXT` is always a valid
    // handle
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr()) };
    if addr.is_null() {
        return Err(Error::SymbolResolution {
            symbol: symbol.to_str().unwrap_or("?"),
        });
    }
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<*mut c_void>());
    // SAFETY: the caller promises `F` is the right fn pointer type
    Ok(unsafe { mem::transmute_copy::<*mut c_void, F>(&addr) })
}

impl Originals {
    /// Look the allocator up in the next object after us in the dynamic
    /// loader's search order, which is what an `LD_PRELOAD` runtime must call
    /// to not call itself.
    pub fn next() -> Result<Self> {
        // SAFETY: each type matches the libc prototype
        unsafe {
            Ok(Self {
                malloc: next_symbol::<MallocFn>(c"malloc")?,
                calloc: next_symbol::<CallocFn>(c"calloc")?,
                realloc: next_symbol::<ReallocFn>(c"realloc")?,
                free: next_symbol::<FreeFn>(c"free")?,
                malloc_usable_size: next_symbol::<UsableSizeFn>(c"malloc_usable_size")?,
            })
        }
    }

    /// Bind straight to libc. Only right when this crate does not export its
    /// own `malloc()`, otherwise these would call back into us.
    pub fn libc() -> Self {
        Self {
            malloc: libc::malloc,
            calloc: libc::calloc,
            realloc: libc::realloc,
            free: libc::free,
            malloc_usable_size: libc::malloc_usable_size,
        }
    }
}
