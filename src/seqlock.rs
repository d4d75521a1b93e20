//! SeqLock - Sequence Lock for single or multiple writers and many readers
//!
//! A SeqLock lets writers update shared memory in place while any number of
//! readers copy it out concurrently. Readers never block writers - they simply
//! retry if the data changed during the read.
//!
//! The writer mode is part of the type: [`SeqLock<SingleWriter>`] has a
//! wait-free `store`, [`SeqLock<MultiWriter>`] serializes writers through an
//! embedded [`SpinLock`]. The read path is identical for both.
//!
//! The lock does not own the guarded bytes. Callers pass closures that touch
//! memory they own; write closures may only write the guarded memory and read
//! closures may only read it.
//!
//! # Performance
//! - Write: two relaxed stores, one barrier, one release store + the closure
//! - Read: two relaxed loads, one acquire fence + the closure, retried on conflict

use crate::spinlock::SpinLock;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache line size for most modern x86_64 and aarch64 CPUs
pub const CACHE_LINE_SIZE: usize = 64;

/// Ensures the wrapped value is on its own cache line
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CacheAligned<T>(pub T);

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::SingleWriter {}
    impl Sealed for super::MultiWriter {}
}

/// Writer mode of a [`SeqLock`]
///
/// Sealed: the only modes are [`SingleWriter`] and [`MultiWriter`].
pub trait Mode: sealed::Sealed + Sized + Send + Sync + 'static {
    /// Writer-side exclusion stored inside the lock
    type WriterLock: Default + fmt::Debug + Send + Sync;

    #[doc(hidden)]
    fn store<F: FnOnce()>(lock: &SeqLock<Self>, f: F);
}

/// Exactly one writer ever calls `store`
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleWriter;

/// Several writers may call `store` / `try_store` concurrently
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiWriter;

impl Mode for SingleWriter {
    type WriterLock = ();

    #[inline(always)]
    fn store<F: FnOnce()>(lock: &SeqLock<Self>, f: F) {
        lock.write_exclusive(f);
    }
}

impl Mode for MultiWriter {
    type WriterLock = SpinLock;

    #[inline(always)]
    fn store<F: FnOnce()>(lock: &SeqLock<Self>, f: F) {
        lock.writer_lock.with(|| lock.write_exclusive(f));
    }
}

/// Orders the counter against the plain accesses of the closure.
///
/// x86 never reorders stores with stores or loads with loads, so stopping
/// the compiler is enough there. Weaker architectures need a full fence.
#[inline(always)]
fn barrier() {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    std::sync::atomic::compiler_fence(Ordering::SeqCst);
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    std::sync::atomic::fence(Ordering::SeqCst);
}

/// Sequence lock
///
/// `#[repr(C)]` and free of pointers so it can be placed in process-shared
/// memory. The counter sits on its own cache line.
#[repr(C)]
pub struct SeqLock<M: Mode> {
    /// Sequence number: odd = write in progress, even = stable
    sequence: CacheAligned<AtomicU64>,
    /// `()` for single writer, a spin lock for multi writer
    writer_lock: M::WriterLock,
    _mode: PhantomData<M>,
}

impl<M: Mode> SeqLock<M> {
    /// Create a quiescent lock (sequence 0)
    pub fn new() -> Self {
        Self {
            sequence: CacheAligned(AtomicU64::new(0)),
            writer_lock: M::WriterLock::default(),
            _mode: PhantomData,
        }
    }

    /// Current sequence number
    ///
    /// Always even unless called from inside a write closure.
    #[inline(always)]
    pub fn sequence(&self) -> u64 {
        self.sequence.0.load(Ordering::Relaxed)
    }

    /// Whether a write is in progress (sequence is odd)
    ///
    /// Best effort only: with several writers the write may already be over
    /// by the time this returns.
    #[inline(always)]
    pub fn write_in_progress(&self) -> bool {
        self.sequence() & 1 == 1
    }

    /// Run `f` as a write
    ///
    /// For [`SingleWriter`] this is wait-free: a fixed number of steps no
    /// matter how many readers are active. For [`MultiWriter`] the caller
    /// first spins on the writer lock, so writers may wait for each other but
    /// never for readers.
    ///
    /// `f` must not panic. A write that unwinds would leave the counter odd
    /// with no writer active, so the process is aborted instead.
    #[inline]
    pub fn store<F: FnOnce()>(&self, f: F) {
        M::store(self, f);
    }

    /// Try to run `f` as a consistent read
    ///
    /// Returns `false` if a write was in progress or happened while `f` ran.
    /// Whatever `f` copied out must then be discarded. If a write was already
    /// in progress `f` is not called at all.
    #[inline]
    pub fn try_load<F: FnOnce()>(&self, f: F) -> bool {
        let start = self.sequence.0.load(Ordering::Relaxed);
        if start & 1 == 1 {
            return false;
        }

        std::sync::atomic::fence(Ordering::Acquire);
        f();
        barrier();

        let end = self.sequence.0.load(Ordering::Relaxed);
        start == end
    }

    /// Run `f` until it completes as a consistent read
    ///
    /// Spins without bound. A writer that stores continuously with no pause
    /// can starve readers in theory.
    #[inline]
    pub fn load<F: FnMut()>(&self, mut f: F) {
        while !self.try_load(&mut f) {
            core::hint::spin_loop();
        }
    }

    /// The write protocol itself. Caller guarantees there is no other writer.
    #[inline(always)]
    fn write_exclusive<F: FnOnce()>(&self, f: F) {
        let seq = self.sequence.0.load(Ordering::Relaxed);
        self.sequence.0.store(seq.wrapping_add(1), Ordering::Relaxed);
        barrier();
        let bomb = AbortOnUnwind;
        f();
        std::mem::forget(bomb);
        self.sequence.0.store(seq.wrapping_add(2), Ordering::Release);
    }
}

impl SeqLock<MultiWriter> {
    /// Run `f` as a write if no other writer holds the lock
    ///
    /// Never spins. Returns `false` without calling `f` when another writer
    /// is active. Like [`SeqLock::store`], `f` must not panic.
    #[inline]
    pub fn try_store<F: FnOnce()>(&self, f: F) -> bool {
        if !self.writer_lock.try_acquire() {
            return false;
        }
        self.write_exclusive(f);
        self.writer_lock.release();
        true
    }

    /// Whether a writer currently holds the writer lock
    #[inline]
    pub fn writer_stalled(&self) -> bool {
        self.writer_lock.is_acquired()
    }
}

/// Only dropped when a write closure unwinds; the counter is odd by then.
struct AbortOnUnwind;

impl Drop for AbortOnUnwind {
    #[cold]
    fn drop(&mut self) {
        tracing::error!("seqlock write closure panicked, aborting");
        std::process::abort();
    }
}

impl<M: Mode> Default for SeqLock<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mode> fmt::Debug for SeqLock<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqLock")
            .field("sequence", &self.sequence())
            .field("writer_lock", &self.writer_lock)
            .finish()
    }
}
