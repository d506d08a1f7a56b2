use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ops::Deref,
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex, PoisonError,
    },
};

use crate::util::hint::cold;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LazyLockState {
    /// Signifies this lock is uninitialized
    Uninit,
    /// Signifies this lock is initialized
    Init,
    /// Signifies this lock is mid initialization. This is only really useful
    /// when checking the state inside the initializer... which is exactly
    /// what the allocation hooks do, since the initializer allocates.
    Initializing,
}

impl LazyLockState {
    const fn from_u8(state: u8) -> Self {
        match state {
            0 => LazyLockState::Uninit,
            1 => LazyLockState::Init,
            _ => LazyLockState::Initializing,
        }
    }
}

/// A LazyLock that let's you poll its initialization state (including mid-init)
///
/// Unlike `std`'s, re-entering it from inside the initializer doesn't
/// deadlock as long as the caller checks [`LazyLock::state()`] first and
/// stays away while it is [`LazyLockState::Initializing`].
pub struct LazyLock<T, F = fn() -> T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    lock: Mutex<()>,
    state: AtomicU8,
    init: F,
}

// SAFETY: `cell` is written once, under `lock`, before `state` is published as
// `Init` with release ordering. After that it is only ever read.
unsafe impl<T, F> Sync for LazyLock<T, F>
where
    T: Send + Sync,
    F: Sync,
{
}

impl<T, F> LazyLock<T, F>
where
    F: Fn() -> T,
{
    pub const fn new(init: F) -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            lock: Mutex::new(()),
            state: AtomicU8::new(LazyLockState::Uninit as u8),
            init,
        }
    }

    pub fn state(lock: &Self) -> LazyLockState {
        LazyLockState::from_u8(lock.state.load(Ordering::Acquire))
    }

    /// The value, if initialization has finished
    pub fn get(lock: &Self) -> Option<&T> {
        match LazyLock::state(lock) {
            // SAFETY: `Init` is only stored after the value is written
            LazyLockState::Init => Some(unsafe { lock.assume_init() }),
            _ => None,
        }
    }

    /// # Safety
    ///
    /// The state must be [`LazyLockState::Init`]
    pub unsafe fn assume_init(&self) -> &T {
        unsafe { (*self.cell.get()).assume_init_ref() }
    }

    pub fn force(lock: &Self) -> &T {
        if LazyLock::state(lock) != LazyLockState::Init {
            cold(|| {
                // The initializer never panics while holding the guard, but a
                // poisoned lock is still just a lock
                let _guard = lock.lock.lock().unwrap_or_else(PoisonError::into_inner);
                // Someone else may have finished while we waited
                if LazyLock::state(lock) == LazyLockState::Uninit {
                    lock.state
                        .store(LazyLockState::Initializing as u8, Ordering::Release);
                    let value = (lock.init)();
                    // SAFETY: we hold `lock` and the state is not `Init`, so
                    // nobody else reads or writes the cell
                    unsafe { (*lock.cell.get()).write(value) };
                    lock.state.store(LazyLockState::Init as u8, Ordering::Release);
                }
            })
        }
        // SAFETY: initialized above, by us or by whoever held the lock
        unsafe { lock.assume_init() }
    }
}

impl<T, F> Deref for LazyLock<T, F>
where
    F: Fn() -> T,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        LazyLock::force(self)
    }
}

impl<T, F> Drop for LazyLock<T, F> {
    fn drop(&mut self) {
        if *self.state.get_mut() == LazyLockState::Init as u8 {
            // SAFETY: initialized, and nobody can be borrowing it any more
            unsafe { self.cell.get_mut().assume_init_drop() }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    static CALLS: AtomicUsize = AtomicUsize::new(0);
    static SEEN_DURING_INIT: AtomicU8 = AtomicU8::new(u8::MAX);
    static LOCK: LazyLock<usize> = LazyLock::new(|| {
        CALLS.fetch_add(1, Ordering::SeqCst);
        SEEN_DURING_INIT.store(LazyLock::state(&LOCK) as u8, Ordering::SeqCst);
        42
    });

    #[test]
    fn initializes_once_and_reports_its_state() {
        let values = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| *LOCK)).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
        });
        assert!(values.iter().all(|&v| v == 42));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(
            SEEN_DURING_INIT.load(Ordering::SeqCst),
            LazyLockState::Initializing as u8
        );
        assert_eq!(LazyLock::state(&LOCK), LazyLockState::Init);
        assert_eq!(LazyLock::get(&LOCK), Some(&42));
    }

    #[test]
    fn get_does_not_initialize() {
        let lock = LazyLock::new(|| String::from("lazy"));
        assert_eq!(LazyLock::get(&lock), None);
        assert_eq!(LazyLock::state(&lock), LazyLockState::Uninit);
        assert_eq!(&*lock, "lazy");
    }
}
