//! SpinLock - writer-side exclusion for multi-writer sequence locks
//!
//! A test-and-test-and-set lock. Waiters spin on a plain load so the cache
//! line stays shared between cores until the holder releases it, and only
//! then retry the atomic swap.
//!
//! Only suitable for very short critical sections. There is no fairness and
//! no parking; `acquire` burns CPU until it succeeds.

use std::sync::atomic::{AtomicBool, Ordering};

/// Binary spin lock
///
/// `#[repr(C)]` so it can live inside process-shared memory.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SpinLock {
    acquired: AtomicBool,
}

impl SpinLock {
    /// Create a released lock
    pub const fn new() -> Self {
        Self {
            acquired: AtomicBool::new(false),
        }
    }

    /// Spin until the lock is held by the caller
    #[inline]
    pub fn acquire(&self) {
        loop {
            if !self.acquired.swap(true, Ordering::Acquire) {
                return;
            }
            while self.acquired.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Try to take the lock once
    ///
    /// Returns `true` if the caller now holds the lock.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        !self.is_acquired() && !self.acquired.swap(true, Ordering::Acquire)
    }

    /// Release the lock
    ///
    /// Must only be called by the current holder.
    #[inline]
    pub fn release(&self) {
        self.acquired.store(false, Ordering::Release);
    }

    /// Whether somebody holds the lock right now
    ///
    /// Racy. Useful for diagnostics, never for exclusion.
    #[inline]
    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Acquire and return a guard that releases on drop
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_> {
        self.acquire();
        SpinGuard { lock: self }
    }

    /// Run `f` while holding the lock
    ///
    /// The lock is released on every exit path, including unwinding.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock();
        f()
    }
}

/// RAII guard returned by [`SpinLock::lock`]
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_spinlock_state_transitions() {
        let lock = SpinLock::new();
        assert!(!lock.is_acquired());

        lock.acquire();
        assert!(lock.is_acquired());
        assert!(!lock.try_acquire());

        lock.release();
        assert!(!lock.is_acquired());

        assert!(lock.try_acquire());
        assert!(lock.is_acquired());

        lock.release();
        assert!(!lock.is_acquired());

        lock.with(|| assert!(lock.is_acquired()));
        assert!(!lock.is_acquired());
    }

    #[test]
    fn test_spinlock_releases_on_panic() {
        let lock = SpinLock::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lock.with(|| panic!("boom"));
        }));

        assert!(result.is_err());
        assert!(!lock.is_acquired());
        assert!(lock.try_acquire());
        lock.release();
    }

    struct Counter {
        lock: SpinLock,
        value: UnsafeCell<u64>,
    }

    // SAFETY: value is only touched while lock is held
    unsafe impl Sync for Counter {}

    #[test]
    fn test_spinlock_mutual_exclusion() {
        const THREADS: usize = 8;
        const INCREMENTS: u64 = 100_000;

        let counter = Arc::new(Counter {
            lock: SpinLock::new(),
            value: UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..INCREMENTS {
                        counter.lock.with(|| unsafe { *counter.value.get() += 1 });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(!counter.lock.is_acquired());
        let total = counter.lock.with(|| unsafe { *counter.value.get() });
        assert_eq!(total, THREADS as u64 * INCREMENTS);
    }
}
