/// Read a single `usize` from `src` into `dst`. `src` can have **no
/// provenance**: the tracer reads roots and object payloads it knows nothing
/// about, some of which other code may be writing concurrently.
///
/// # Safety
/// - `src` must be mapped and readable, or you get the SIGSEGV (or, for the
///   safe heap, the pkey fault) that you deserve
#[inline(always)]
pub unsafe fn usize_raw_load_acquire(dst: &mut usize, src: *const usize) {
    debug_assert!(src.is_aligned());
    debug_assert!(!src.is_null());

    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::asm;

        // In x86, things are properly ordered by default, and these operations
        // are atomic!
        asm! {
            "mov rax, [{src}]",
            "mov [{dst}], rax",
            src = in(reg) src,
            dst = in(reg) dst as *mut usize,
            out("rax") _,
            options(nostack, preserves_flags),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    unsafe {
        *dst = core::ptr::read_volatile(src);
    }
}

/// Read a single `usize` from `src`. `src` can have **no provenance**
///
/// # Safety
/// - See [`usize_raw_load_acquire()`]
///
/// # Panics
/// - In debug mode if `src` is `NULL`
/// - In debug mode if `src` is misaligned
#[inline(always)]
pub unsafe fn usize_load_acq(src: *const usize) -> usize {
    let mut dst = 0;
    usize_raw_load_acquire(&mut dst, src);
    dst
}

/// The current stack pointer of the calling frame. Inlined so that it is the
/// caller's `rsp`, not ours.
#[inline(always)]
pub fn stack_pointer() -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        let sp: usize;
        // SAFETY: reads a register, touches nothing
        unsafe {
            std::arch::asm!(
                "mov {}, rsp",
                out(reg) sp,
                options(nomem, nostack, preserves_flags),
            );
        }
        sp
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let marker = 0u8;
        core::hint::black_box(&marker) as *const u8 as usize
    }
}
