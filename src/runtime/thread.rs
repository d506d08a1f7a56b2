//! Per-thread safe-block state.
//!
//! All of it is `const`-initialized and needs no destructor, so touching it
//! never registers a TLS dtor, and so never allocates. That matters: the
//! first access usually happens inside `malloc()`.

use std::cell::Cell;

use crate::os::phdr::StackRegion;

thread_local! {
    /// Safe blocks entered and not yet exited. Blocks nest, only the
    /// outermost one sets the stack bottom and the permission.
    static DEPTH: Cell<u32> = const { Cell::new(0) };
    static EXEMPT: Cell<bool> = const { Cell::new(false) };
    static SAFE_STACK: Cell<StackRegion> = const { Cell::new(StackRegion::EMPTY) };
}

pub fn in_safe_block() -> bool {
    DEPTH.with(Cell::get) > 0
}

pub fn is_exempt() -> bool {
    EXEMPT.with(Cell::get)
}

pub fn set_exempt(exempt: bool) {
    EXEMPT.with(|e| e.set(exempt))
}

pub fn safe_stack() -> StackRegion {
    SAFE_STACK.with(Cell::get)
}

/// Enter a block whose outermost frame is at `frame`. `true` if this is the
/// outermost block.
pub fn enter(frame: usize) -> bool {
    let depth = DEPTH.with(|d| {
        d.set(d.get().saturating_add(1));
        d.get()
    });
    if depth == 1 {
        SAFE_STACK.with(|stack| {
            let mut region = StackRegion::EMPTY;
            region.set_bottom(frame);
            stack.set(region);
        });
    }
    depth == 1
}

/// Leave the innermost block. `Some(true)` if that was the outermost one,
/// `None` if there was no block to leave.
pub fn exit() -> Option<bool> {
    let depth = DEPTH.with(Cell::get);
    if depth == 0 {
        return None;
    }
    DEPTH.with(|d| d.set(depth - 1));
    if depth > 1 {
        return Some(false);
    }
    SAFE_STACK.with(|stack| stack.set(StackRegion::EMPTY));
    EXEMPT.with(|e| e.set(false));
    Some(true)
}

/// Record the stack pointer of a free request, returning the window to scan
pub fn capture_stack_top(sp: usize) -> StackRegion {
    SAFE_STACK.with(|stack| {
        let mut region = stack.get();
        region.set_top(sp);
        stack.set(region);
        region
    })
}
