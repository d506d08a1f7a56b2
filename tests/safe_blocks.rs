//! End-to-end behaviour of a [`Runtime`], driven the way the allocator hooks
//! drive it, with emulated protection keys.
//!
//! Conservative tracing means a stale copy of a pointer anywhere on the
//! scanned stack keeps its object alive. So addresses the tests want to see
//! reclaimed are only ever held inverted (`!addr`), allocated in helper frames
//! that are scrubbed before the collections that count.

use std::{
    ffi::c_void,
    hint::black_box,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use safeheap::{os::pkey::Isolation, Config, Originals, Runtime};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn runtime(scan_globals: bool) -> Box<Runtime> {
    init_logging();
    let config = Config {
        heap_size: 64 << 20,
        heap_hint: 0,
        meta_size: 16 << 20,
        isolation: Isolation::Emulated,
        scan_globals,
        // The test binary is the module these globals live in
        skip_own_module: false,
        ..Config::default()
    };
    // Boxed, so that the heap's own bookkeeping is not on the scanned stack
    Box::new(Runtime::new(config, Originals::libc()).unwrap())
}

macro_rules! enter {
    ($rt:expr) => {{
        let anchor = 0usize;
        $rt.enter_safe_block(black_box(&anchor) as *const usize as usize);
    }};
}

/// Overwrite the dead part of the stack below the caller
#[inline(never)]
fn scrub_stack() {
    let mut junk = [0usize; 4096];
    black_box(&mut junk);
}

/// Run `n` collections, each triggered by freeing a fresh zeroed object. Of a
/// size class the objects under test don't share, so their chunks aren't
/// handed out again here.
#[inline(never)]
fn churn(rt: &Runtime, n: usize) {
    for _ in 0..n {
        let p = rt.calloc(1, 256);
        unsafe { rt.free(p) };
        scrub_stack();
    }
}

#[inline(never)]
fn free_while_a_local_still_points_at_it(rt: &Runtime) -> usize {
    // Kept in memory, where the scan can see it
    let mut local = [rt.malloc(16) as usize];
    black_box(&mut local);
    // Never freed, keeps the chunk after ours from merging with it
    black_box(rt.malloc(16));
    let a = local[0] as *mut c_void;
    unsafe {
        a.cast::<u64>().write(0x5afe_b10c);
        rt.free(a);
    }
    // Referenced by `local`, and freed only just now
    assert!(rt.is_tracked(local[0]));
    assert!(rt.is_requested_free(local[0]));
    assert_eq!(unsafe { (local[0] as *const u64).read() }, 0x5afe_b10c);
    let hidden = !local[0];
    local[0] = 0;
    black_box(&mut local);
    hidden
}

#[test]
fn stack_local_reference_dies_with_the_local() {
    let rt = runtime(false);
    enter!(rt);
    let hidden = free_while_a_local_still_points_at_it(&rt);
    scrub_stack();
    churn(&rt, 4);
    assert!(!rt.is_tracked(!hidden));
    let stats = rt.stats().unwrap();
    assert!(stats.actual_frees >= 1);
    assert_eq!(stats.free_requests, 5);
    rt.exit_safe_block();
    rt.teardown().unwrap();
}

static GLOBAL_REF: AtomicUsize = AtomicUsize::new(0);

#[inline(never)]
fn free_while_a_global_points_at_it(rt: &Runtime) -> usize {
    let a = rt.malloc(16);
    black_box(rt.malloc(16));
    unsafe { a.cast::<u64>().write(0x6106a1) };
    GLOBAL_REF.store(a as usize, Ordering::SeqCst);
    unsafe { rt.free(a) };
    !(a as usize)
}

#[test]
fn global_reference_keeps_the_object_until_cleared() {
    let rt = runtime(true);
    enter!(rt);
    let hidden = free_while_a_global_points_at_it(&rt);
    scrub_stack();
    churn(&rt, 4);
    assert!(rt.is_tracked(!hidden));
    assert!(rt.is_requested_free(!hidden));
    // Not reclaimed, so not reused either
    assert_eq!(unsafe { (!hidden as *const u64).read() }, 0x6106a1);

    GLOBAL_REF.store(0, Ordering::SeqCst);
    scrub_stack();
    churn(&rt, 4);
    assert!(!rt.is_tracked(!hidden));
    rt.exit_safe_block();
    rt.teardown().unwrap();
}

#[test]
fn heap_references_chain_reachability() {
    let rt = runtime(false);
    enter!(rt);
    // `head` stays on the stack, `tail` is reachable only through it
    let mut roots = [rt.malloc(16) as usize];
    black_box(&mut roots);
    let hidden = !(rt.malloc(16) as usize);
    unsafe {
        (roots[0] as *mut usize).write(!hidden);
        rt.free(!hidden as *mut c_void);
    }
    scrub_stack();
    churn(&rt, 4);
    assert!(rt.is_tracked(!hidden));
    assert!(rt.is_requested_free(!hidden));
    black_box(&roots);
    rt.exit_safe_block();
    rt.teardown().unwrap();
}

#[test]
fn exempt_allocations_survive_purge() {
    let rt = runtime(false);
    enter!(rt);
    let tracked = rt.malloc(32);
    rt.set_exempt();
    let exempt = rt.malloc(32);
    rt.unset_exempt();
    unsafe { exempt.cast::<u8>().write_bytes(0xe5, 32) };

    assert!(!rt.owns(exempt as usize));
    assert!(!rt.is_tracked(exempt as usize));
    assert!(rt.is_tracked(tracked as usize));

    rt.purge_safe_block();
    assert!(!rt.is_tracked(tracked as usize));
    let bytes = unsafe { std::slice::from_raw_parts(exempt.cast::<u8>(), 32) };
    assert!(bytes.iter().all(|&b| b == 0xe5));
    // Goes back to the allocator it came from
    unsafe { rt.free(exempt) };
    rt.exit_safe_block();
    rt.teardown().unwrap();
}

#[test]
fn free_null_is_a_no_op_everywhere() {
    let rt = runtime(false);
    unsafe { rt.free(ptr::null_mut()) };
    enter!(rt);
    unsafe { rt.free(ptr::null_mut()) };
    assert_eq!(rt.stats().unwrap().free_requests, 0);
    assert_eq!(rt.stats().unwrap().cycles, 0);
    rt.exit_safe_block();
    rt.teardown().unwrap();
}

#[test]
fn blocks_nest() {
    let rt = runtime(false);
    enter!(rt);
    let p = rt.malloc(8);
    enter!(rt);
    rt.exit_safe_block();
    // Still inside the outer block
    assert!(rt.owns(rt.malloc(8) as usize));
    rt.exit_safe_block();
    assert!(!rt.owns(rt.malloc(8) as usize));
    assert!(rt.is_tracked(p as usize));
    rt.teardown().unwrap();
}

#[test]
fn threads_have_their_own_blocks() {
    let rt = runtime(false);
    enter!(rt);
    let inside = rt.malloc(8);
    assert!(rt.owns(inside as usize));
    std::thread::scope(|s| {
        s.spawn(|| {
            // Not in a block here, and no access
            assert_eq!(rt.permission(), Some(safeheap::os::pkey::Permission::NoAccess));
            let p = rt.malloc(8);
            assert!(!rt.owns(p as usize));
            unsafe { rt.free(p) };
        });
    });
    rt.exit_safe_block();
    rt.teardown().unwrap();
}
