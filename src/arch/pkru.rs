//! The PKRU register. Two bits per protection key, `AD` (access disable) at
//! `2 * key` and `WD` (write disable) at `2 * key + 1`. The register is per
//! thread, so everything in here only ever affects the calling thread.

pub const PKEY_DISABLE_ACCESS: u32 = 0b01;
pub const PKEY_DISABLE_WRITE: u32 = 0b10;
pub const PKEY_BITS_MASK: u32 = 0b11;

/// Number of keys the register has room for
pub const NR_PKEYS: u32 = 16;

/// What Linux puts in PKRU for a new thread: every key but the default key 0
/// access-disabled
pub const INIT_PKRU: u32 = 0x5555_5554;

/// Read PKRU.
///
/// # Safety
/// - The CPU must support PKU and the OS must have enabled it (`pkey_alloc()`
///   succeeding is proof of both), otherwise this is `#UD`
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn rdpkru() -> u32 {
    let pkru: u32;
    unsafe {
        std::arch::asm!(
            "rdpkru",
            in("ecx") 0u32,
            out("eax") pkru,
            out("edx") _,
            options(nomem, nostack, preserves_flags),
        );
    }
    pkru
}

/// Write PKRU. This changes what memory the calling thread may touch, so it
/// must not be reordered with memory accesses (no `nomem`).
///
/// # Safety
/// - Same as [`rdpkru()`]
/// - Revoking access to memory the caller is about to use will fault
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn wrpkru(pkru: u32) {
    unsafe {
        std::arch::asm!(
            "wrpkru",
            in("eax") pkru,
            in("ecx") 0u32,
            in("edx") 0u32,
            options(nostack, preserves_flags),
        );
    }
}

/// Extract the two permission bits for `key` out of a PKRU value
pub const fn key_bits(pkru: u32, key: u32) -> u32 {
    (pkru >> (2 * key)) & PKEY_BITS_MASK
}

/// Replace the two permission bits for `key` in a PKRU value
pub const fn with_key_bits(pkru: u32, key: u32, bits: u32) -> u32 {
    (pkru & !(PKEY_BITS_MASK << (2 * key))) | ((bits & PKEY_BITS_MASK) << (2 * key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bits_are_independent() {
        let pkru = with_key_bits(0, 3, PKEY_DISABLE_ACCESS);
        let pkru = with_key_bits(pkru, 4, PKEY_DISABLE_WRITE);
        assert_eq!(key_bits(pkru, 3), PKEY_DISABLE_ACCESS);
        assert_eq!(key_bits(pkru, 4), PKEY_DISABLE_WRITE);
        assert_eq!(key_bits(pkru, 0), 0);
        let pkru = with_key_bits(pkru, 3, 0);
        assert_eq!(key_bits(pkru, 3), 0);
        assert_eq!(key_bits(pkru, 4), PKEY_DISABLE_WRITE);
    }
}
