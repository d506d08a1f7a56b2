//! Memory protection keys.
//!
//! A key is bound to pages once (`pkey_mprotect()`), after which each thread
//! decides for itself whether it may read or write those pages by flipping two
//! bits in its own PKRU register. No page tables change and no syscall is
//! made, so raising and dropping access around a safe block is cheap.
//!
//! [`Isolation::Emulated`] replaces the hardware with a per-thread software
//! register. It gates nothing, but it keeps every permission transition (and
//! every sanity check that depends on it) observable on hosts without PKU.

use std::{
    cell::Cell,
    io,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{
    arch::pkru::{self, key_bits, with_key_bits, INIT_PKRU, PKEY_DISABLE_ACCESS, PKEY_DISABLE_WRITE},
    error::{Error, Result},
};

/// Access the calling thread has to the pages bound to a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Permission {
    ReadWrite = 0,
    ReadOnly = PKEY_DISABLE_WRITE,
    NoAccess = PKEY_DISABLE_ACCESS,
}

impl Permission {
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Decode PKRU bits. Access-disable wins over write-disable.
    pub const fn from_bits(bits: u32) -> Self {
        if bits & PKEY_DISABLE_ACCESS != 0 {
            Permission::NoAccess
        } else if bits & PKEY_DISABLE_WRITE != 0 {
            Permission::ReadOnly
        } else {
            Permission::ReadWrite
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Real protection keys, faults on any access outside a safe block
    Hardware,
    /// Software bookkeeping of the permission state only
    Emulated,
}

thread_local! {
    static EMULATED_PKRU: Cell<u32> = const { Cell::new(INIT_PKRU) };
}

/// Virtual key ids for [`Isolation::Emulated`]. Key 0 is the default key in
/// hardware, so we never hand it out here either.
static NEXT_EMULATED_KEY: AtomicU32 = AtomicU32::new(1);

/// A key id, without ownership of the key. Any thread can use one to read or
/// change its own access to the key's pages, with no locking, while whoever
/// owns the [`ProtectionKey`] keeps it alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHandle {
    id: u32,
    isolation: Isolation,
}

impl KeyHandle {
    pub const fn id(&self) -> u32 {
        self.id
    }

    pub const fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// The calling thread's current access level for this key
    pub fn permission(&self) -> Permission {
        Permission::from_bits(key_bits(self.read_pkru(), self.id))
    }

    /// Set the calling thread's access level, then read it back. A mismatch
    /// means the register is not doing what we think it is.
    pub fn set_permission(&self, perm: Permission) -> Result<()> {
        let pkru = with_key_bits(self.read_pkru(), self.id, perm.bits());
        self.write_pkru(pkru);
        let actual = self.permission();
        if actual != perm {
            return Err(Error::PermissionNotApplied {
                key: self.id,
                requested: perm,
                actual,
            });
        }
        Ok(())
    }

    fn read_pkru(&self) -> u32 {
        match self.isolation {
            Isolation::Hardware => sys::read_pkru(),
            Isolation::Emulated => EMULATED_PKRU.with(Cell::get),
        }
    }

    fn write_pkru(&self, value: u32) {
        match self.isolation {
            Isolation::Hardware => sys::write_pkru(value),
            Isolation::Emulated => EMULATED_PKRU.with(|pkru| pkru.set(value)),
        }
    }
}

/// An allocated protection key. Freed on drop.
#[derive(Debug)]
pub struct ProtectionKey {
    handle: KeyHandle,
}

impl ProtectionKey {
    /// Allocate a new key. The calling thread gets read/write access to it,
    /// every other thread starts out with none. With [`Isolation::Hardware`]
    /// this fails on exhaustion (`ENOSPC`) or when the CPU or kernel lacks PKU
    /// support.
    pub fn alloc(isolation: Isolation) -> Result<Self> {
        let id = match isolation {
            Isolation::Hardware => sys::pkey_alloc()?,
            Isolation::Emulated => {
                let n = NEXT_EMULATED_KEY.fetch_add(1, Ordering::Relaxed);
                let id = 1 + n % (pkru::NR_PKEYS - 1);
                EMULATED_PKRU.with(|pkru| pkru.set(with_key_bits(pkru.get(), id, 0)));
                id
            }
        };
        log::debug!("[pkey] allocated key {id} ({isolation:?})");
        Ok(Self {
            handle: KeyHandle { id, isolation },
        })
    }

    pub const fn id(&self) -> u32 {
        self.handle.id
    }

    pub const fn isolation(&self) -> Isolation {
        self.handle.isolation
    }

    pub const fn handle(&self) -> KeyHandle {
        self.handle
    }

    /// Bind this key to `[addr, addr + len)`, keeping the pages read/write at
    /// the page-table level. From now on, PKRU alone decides access.
    pub fn protect(&self, addr: usize, len: usize) -> Result<()> {
        match self.isolation() {
            Isolation::Hardware => sys::pkey_mprotect(addr, len, self.id()),
            Isolation::Emulated => Ok(()),
        }
    }

    pub fn permission(&self) -> Permission {
        self.handle.permission()
    }

    pub fn set_permission(&self, perm: Permission) -> Result<()> {
        self.handle.set_permission(perm)
    }

    /// Release the key, reporting failure
    pub fn free(self) -> Result<()> {
        let this = std::mem::ManuallyDrop::new(self);
        this.release()
    }

    fn release(&self) -> Result<()> {
        let id = self.id();
        match self.isolation() {
            Isolation::Hardware => sys::pkey_free(id),
            Isolation::Emulated => {
                EMULATED_PKRU.with(|pkru| {
                    pkru.set(with_key_bits(pkru.get(), id, key_bits(INIT_PKRU, id)))
                });
                Ok(())
            }
        }
    }
}

impl Drop for ProtectionKey {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("[pkey] {e}");
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod sys {
    use super::*;

    pub fn pkey_alloc() -> Result<u32> {
        // SAFETY: no memory is passed to the kernel
        let ret = unsafe { libc::syscall(libc::SYS_pkey_alloc, 0, 0) };
        if ret < 0 {
            return Err(Error::PkeyAlloc(io::Error::last_os_error()));
        }
        Ok(ret as u32)
    }

    pub fn pkey_mprotect(addr: usize, len: usize, key: u32) -> Result<()> {
        // SAFETY: the caller owns the range, and we keep it read/write so no
        // live reference is invalidated
        let ret = unsafe {
            libc::syscall(
                libc::SYS_pkey_mprotect,
                addr,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                key,
            )
        };
        if ret != 0 {
            return Err(Error::PkeyProtect {
                key,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub fn pkey_free(key: u32) -> Result<()> {
        // SAFETY: no memory is passed to the kernel
        let ret = unsafe { libc::syscall(libc::SYS_pkey_free, key) };
        if ret != 0 {
            return Err(Error::PkeyFree {
                key,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub fn read_pkru() -> u32 {
        // SAFETY: a hardware key exists, so `pkey_alloc()` has succeeded,
        // which it only does when PKU is supported and enabled
        unsafe { pkru::rdpkru() }
    }

    pub fn write_pkru(value: u32) {
        // SAFETY: as `read_pkru()`. Revoking access is the point.
        unsafe { pkru::wrpkru(value) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
mod sys {
    use super::*;

    pub fn pkey_alloc() -> Result<u32> {
        Err(Error::PkeyUnsupported)
    }

    pub fn pkey_mprotect(_: usize, _: usize, _: u32) -> Result<()> {
        Err(Error::PkeyUnsupported)
    }

    pub fn pkey_free(_: u32) -> Result<()> {
        Err(Error::PkeyUnsupported)
    }

    pub fn read_pkru() -> u32 {
        unreachable!("no hardware key can exist on this target")
    }

    pub fn write_pkru(_: u32) {
        unreachable!("no hardware key can exist on this target")
    }
}

/// Try to allocate a hardware key, `None` when the host has no PKU. For tests
/// that only make sense with real keys.
#[cfg(test)]
pub(crate) fn hardware_key_or_skip() -> Option<ProtectionKey> {
    match ProtectionKey::alloc(Isolation::Hardware) {
        Ok(key) => Some(key),
        Err(e) => {
            eprintln!("skipping: no hardware protection keys ({e})");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bits_round_trip_through_pkru_encoding() {
        for perm in [Permission::ReadWrite, Permission::ReadOnly, Permission::NoAccess] {
            assert_eq!(Permission::from_bits(perm.bits()), perm);
        }
        // Both bits set still means no access at all
        assert_eq!(Permission::from_bits(0b11), Permission::NoAccess);
    }

    #[test]
    fn emulated_permission_is_per_thread() {
        let key = ProtectionKey::alloc(Isolation::Emulated).unwrap();
        assert_eq!(key.permission(), Permission::ReadWrite);

        let handle = key.handle();
        let other_thread = std::thread::spawn(move || handle.permission()).join().unwrap();
        assert_eq!(other_thread, Permission::NoAccess);

        key.set_permission(Permission::ReadOnly).unwrap();
        assert_eq!(key.permission(), Permission::ReadOnly);
        key.set_permission(Permission::NoAccess).unwrap();
        assert_eq!(key.permission(), Permission::NoAccess);
        key.free().unwrap();
    }

    #[test]
    fn hardware_permission_round_trip() {
        let Some(key) = hardware_key_or_skip() else {
            return;
        };
        key.set_permission(Permission::NoAccess).unwrap();
        assert_eq!(key.permission(), Permission::NoAccess);
        key.set_permission(Permission::ReadWrite).unwrap();
        assert_eq!(key.permission(), Permission::ReadWrite);
        key.free().unwrap();
    }
}
