//! Fixed-capacity byte region guarded by a [`SeqLock`]
//!
//! The region is pointer-free and `#[repr(C)]`, so the same byte image can be
//! mapped by several processes through [`SharedMemory`](crate::shm::SharedMemory).

use crate::seqlock::{Mode, MultiWriter, SeqLock, SingleWriter};
use std::cell::UnsafeCell;
use std::fmt;

/// `N` bytes guarded by a sequence lock of mode `M`
#[repr(C)]
pub struct SharedRegion<M: Mode, const N: usize> {
    lock: SeqLock<M>,
    data: UnsafeCell<[u8; N]>,
}

/// Region written by exactly one writer
pub type SingleWriterRegion<const N: usize> = SharedRegion<SingleWriter, N>;

/// Region written by any number of writers
pub type MultiWriterRegion<const N: usize> = SharedRegion<MultiWriter, N>;

// SAFETY: `data` is only written inside `lock.store` and only read inside
// `lock.try_load`, which discards reads that overlapped a write.
unsafe impl<M: Mode, const N: usize> Sync for SharedRegion<M, N> {}

impl<M: Mode, const N: usize> SharedRegion<M, N> {
    /// Zero-filled region with a quiescent lock
    pub fn new() -> Self {
        Self {
            lock: SeqLock::new(),
            data: UnsafeCell::new([0; N]),
        }
    }

    /// Number of guarded bytes
    #[inline(always)]
    pub const fn capacity() -> usize {
        N
    }

    /// The lock guarding the bytes
    #[inline(always)]
    pub fn lock(&self) -> &SeqLock<M> {
        &self.lock
    }

    /// Current sequence number of the lock
    #[inline(always)]
    pub fn sequence(&self) -> u64 {
        self.lock.sequence()
    }

    /// Copy `bytes` into the front of the region
    ///
    /// At most `N` bytes are written. Returns the number of bytes copied.
    #[inline]
    pub fn store(&self, bytes: &[u8]) -> usize {
        let len = bytes.len().min(N);
        self.lock.store(|| unsafe { self.write_raw(bytes, len) });
        len
    }

    /// Fill the whole region with `value`
    #[inline]
    pub fn set(&self, value: u8) {
        self.lock
            .store(|| unsafe { std::ptr::write_bytes(self.data_ptr(), value, N) });
    }

    /// Copy the front of the region into `into`, retrying until consistent
    ///
    /// Returns the number of bytes copied, `min(into.len(), N)`.
    #[inline]
    pub fn load(&self, into: &mut [u8]) -> usize {
        let len = into.len().min(N);
        let dst = into.as_mut_ptr();
        self.lock.load(|| unsafe { self.read_raw(dst, len) });
        len
    }

    /// Single read attempt
    ///
    /// On `false` the contents of `into` are garbage and must be ignored.
    #[inline]
    pub fn try_load(&self, into: &mut [u8]) -> bool {
        let len = into.len().min(N);
        let dst = into.as_mut_ptr();
        self.lock.try_load(|| unsafe { self.read_raw(dst, len) })
    }

    #[inline(always)]
    fn data_ptr(&self) -> *mut u8 {
        self.data.get() as *mut u8
    }

    /// # Safety
    /// Must run inside `lock.store`, `len <= min(bytes.len(), N)`.
    #[inline(always)]
    unsafe fn write_raw(&self, bytes: &[u8], len: usize) {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr(), len);
    }

    /// # Safety
    /// Must run inside `lock.try_load`, `dst` valid for `len <= N` bytes.
    #[inline(always)]
    unsafe fn read_raw(&self, dst: *mut u8, len: usize) {
        std::ptr::copy_nonoverlapping(self.data_ptr() as *const u8, dst, len);
    }
}

impl<const N: usize> SharedRegion<MultiWriter, N> {
    /// Store without waiting for other writers
    ///
    /// Returns `None` if another writer is active, otherwise the number of
    /// bytes copied.
    #[inline]
    pub fn try_store(&self, bytes: &[u8]) -> Option<usize> {
        let len = bytes.len().min(N);
        self.lock
            .try_store(|| unsafe { self.write_raw(bytes, len) })
            .then_some(len)
    }
}

impl<M: Mode, const N: usize> Default for SharedRegion<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Mode, const N: usize> fmt::Debug for SharedRegion<M, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("capacity", &N)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_region_store_load() {
        let region = SingleWriterRegion::<16>::new();
        assert_eq!(SingleWriterRegion::<16>::capacity(), 16);

        assert_eq!(region.store(b"Hello, SeqLock!"), 15);
        assert_eq!(region.sequence(), 2);

        let mut buf = [0u8; 15];
        assert_eq!(region.load(&mut buf), 15);
        assert_eq!(&buf, b"Hello, SeqLock!");
    }

    #[test]
    fn test_region_clamps_to_capacity() {
        let region = SingleWriterRegion::<4>::new();

        assert_eq!(region.store(&[7u8; 32]), 4);

        let mut big = [0u8; 8];
        assert_eq!(region.load(&mut big), 4);
        assert_eq!(big, [7, 7, 7, 7, 0, 0, 0, 0]);

        let mut small = [0u8; 2];
        assert_eq!(region.load(&mut small), 2);
        assert_eq!(small, [7, 7]);
    }

    #[test]
    fn test_region_set() {
        let region = MultiWriterRegion::<64>::new();
        region.set(0xAB);

        let mut buf = [0u8; 64];
        assert!(region.try_load(&mut buf));
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_region_try_store() {
        let region = MultiWriterRegion::<8>::new();
        assert_eq!(region.try_store(b"abc"), Some(3));

        region.lock().store(|| {
            assert!(region.lock().writer_stalled());
        });
        assert!(!region.lock().writer_stalled());

        let mut buf = [0u8; 3];
        region.load(&mut buf);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_region_concurrent_set_and_load() {
        const SIZE: usize = 1024;

        let region = Arc::new(SingleWriterRegion::<SIZE>::new());
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let region = Arc::clone(&region);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut buf = [0u8; SIZE];
                let mut seen = [false; 128];
                loop {
                    region.load(&mut buf);
                    assert!(buf.iter().all(|&b| b == buf[0]));
                    seen[buf[0] as usize] = true;
                    if done.load(Ordering::Acquire) {
                        break;
                    }
                }
                seen.iter().filter(|&&s| s).count()
            })
        };

        for i in 0..100_000usize {
            region.set((i & 127) as u8);
        }
        done.store(true, Ordering::Release);

        assert!(reader.join().unwrap() >= 1);
    }
}
