//! The C API, see `include/safe_blocks.h`. Programs declare these weak, so
//! they run unchanged when the runtime isn't preloaded.

use std::ffi::c_void;

use crate::runtime::{hooks::HOOKS, Runtime};

fn runtime() -> &'static Runtime {
    HOOKS.runtime()
}

/// Start a safe block. `stack_bottom` must be the caller's own frame address
/// (`__builtin_frame_address(0)`): everything from there down to a later
/// `free()` is scanned for references.
#[no_mangle]
pub extern "C" fn enter_safe_block(stack_bottom: *mut c_void) {
    runtime().enter_safe_block(stack_bottom as usize)
}

#[no_mangle]
pub extern "C" fn exit_safe_block() {
    runtime().exit_safe_block()
}

/// Allocations from here to `unset_exempt()` skip the safe heap. Only valid
/// inside a safe block.
#[no_mangle]
pub extern "C" fn set_exempt() {
    runtime().set_exempt()
}

#[no_mangle]
pub extern "C" fn unset_exempt() {
    runtime().unset_exempt()
}

/// Reclaim every object in the safe heap, referenced or not
#[no_mangle]
pub extern "C" fn purge_safe_block() {
    runtime().purge_safe_block()
}

#[no_mangle]
pub extern "C" fn safeheap_dump() {
    runtime().dump()
}
