//! A malloc runtime that keeps freed memory in quarantine until nothing can
//! reach it.
//!
//! Inside a *safe block*, allocations come from a heap of their own that is
//! guarded by a memory protection key. Freeing an object there only asks for
//! it to go: a conservative mark-sweep pass over the program's globals, the
//! block's stack and the heap itself decides when it really can. Outside any
//! block the heap is inaccessible, so a dangling pointer into it faults
//! instead of reading whatever got allocated in its place.
//!
//! Preload the `cdylib` built with `--features interpose` to use it on a C
//! program, see `include/safe_blocks.h`. From Rust, see [`client`].

pub mod alloc;
pub mod arch;
pub mod client;
pub mod config;
pub mod error;
#[cfg(feature = "interpose")]
pub mod externc;
#[cfg_attr(not(feature = "interpose"), allow(dead_code))]
mod lazy_lock;
pub mod logger;
pub mod os;
pub mod runtime;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::{Originals, Runtime};
