use core::mem;

/// Round up `n` to the nearest `to`
pub const fn round_up(n: usize, to: usize) -> usize {
    to * n.div_ceil(to)
}

/// Align `addr` up to `align`, which must be a power of two
pub const fn align_up(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr.wrapping_add(align - 1) & !(align - 1)
}

/// Align `addr` down to `align`, which must be a power of two
pub const fn align_down(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

pub const fn word_align_up(addr: usize) -> usize {
    align_up(addr, mem::align_of::<usize>())
}

pub const fn word_align_down(addr: usize) -> usize {
    align_down(addr, mem::align_of::<usize>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn round_up_computes_correctly() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_up(10, 3), 12);
    }

    #[test]
    pub fn word_alignment_rounds_towards_the_right_end() {
        assert_eq!(word_align_up(0x1001), 0x1008);
        assert_eq!(word_align_up(0x1008), 0x1008);
        assert_eq!(word_align_down(0x100f), 0x1008);
        assert_eq!(word_align_down(0x1008), 0x1008);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_down(17, 16), 16);
    }
}
