use std::io;

use thiserror::Error;

use crate::os::pkey::Permission;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Ways the safe-block contract can be broken by a caller (or by us). All of
/// these are fatal: carrying on would mean running with the isolation
/// guarantee silently switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("calling exempt outside a safe block is not allowed")]
    ExemptOutsideBlock,
    #[error("calling purge outside a safe block is not allowed")]
    PurgeOutsideBlock,
    #[error("in safe block, yet the safe heap is not read-write ({0:?})")]
    MissingPermission(Permission),
    #[error("in safe block, yet the safe stack bottom is not set")]
    StackBottomUnset,
    #[error("outside any safe block, yet the safe heap is read-write")]
    PermissionLeaked,
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("pkey_alloc failed: {0}")]
    PkeyAlloc(#[source] io::Error),
    #[error("pkey_mprotect with key {key} failed: {source}")]
    PkeyProtect { key: u32, source: io::Error },
    #[error("pkey_free of key {key} failed: {source}")]
    PkeyFree { key: u32, source: io::Error },
    #[error("protection key {key} is {actual:?} after setting it to {requested:?}")]
    PermissionNotApplied {
        key: u32,
        requested: Permission,
        actual: Permission,
    },
    #[error("protection keys are not supported on this target")]
    PkeyUnsupported,
    #[error("mmap of {size} bytes failed: {source}")]
    Map { size: usize, source: io::Error },
    #[error("attempted to mmap() 0 bytes")]
    EmptyMap,
    #[error("munmap failed: {0}")]
    Unmap(#[source] io::Error),
    #[error("metadata heap could not grow to {0} bytes")]
    MetadataExhausted(usize),
    #[error("{0:#x} addr not found")]
    NotFound(usize),
    #[error("more than {0} writable segments loaded")]
    TooManySegments(usize),
    #[error("unable to resolve original `{symbol}`")]
    SymbolResolution { symbol: &'static str },
    #[error(transparent)]
    Violation(#[from] Violation),
    #[error("invalid value {value:?} for {var}")]
    Config { var: &'static str, value: String },
}

impl Error {
    /// Unrecoverable errors are the ones where continuing could hand out
    /// memory, or run code, with the isolation guarantee no longer holding.
    /// The runtime terminates the process on these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SymbolResolution { .. }
                | Error::PermissionNotApplied { .. }
                | Error::Violation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_taxonomy() {
        assert!(Error::from(Violation::PurgeOutsideBlock).is_fatal());
        assert!(Error::SymbolResolution { symbol: "malloc" }.is_fatal());
        assert!(Error::PermissionNotApplied {
            key: 1,
            requested: Permission::ReadWrite,
            actual: Permission::NoAccess,
        }
        .is_fatal());
        assert!(!Error::NotFound(0x10).is_fatal());
        assert!(!Error::MetadataExhausted(4096).is_fatal());
        assert!(!Error::TooManySegments(64).is_fatal());
    }

    #[test]
    fn not_found_names_the_address() {
        assert_eq!(Error::NotFound(0x1230).to_string(), "0x1230 addr not found");
    }
}
