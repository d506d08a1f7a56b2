/// Test if `addr` is aligned to a multiple of `align`
pub const fn aligned_to(addr: usize, align: usize) -> bool {
    addr % align == 0
}

/// Test if `addr` is aligned for a machine word, the granularity at which the
/// tracer reads memory
pub const fn word_aligned(addr: usize) -> bool {
    aligned_to(addr, core::mem::align_of::<usize>())
}
