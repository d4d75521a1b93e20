//! C Bindings for seqlock_shm
//!
//! Exposes a single-writer sequence lock behind an opaque handle. The handle
//! either guards a caller-owned buffer or a named shared memory segment laid
//! out as `[SeqLock<SingleWriter> | data...]`.
//!
//! Constructors return NULL on failure and set `errno`. All other functions
//! take NULL or a handle obtained from a constructor and not yet destroyed;
//! NULL handles and buffers are ignored.

use crate::error::ShmError;
use crate::seqlock::{SeqLock, SingleWriter};
use crate::shm::SharedMemory;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;
use tracing::error;

type Lock = SeqLock<SingleWriter>;

enum Backing {
    /// Guards memory owned by the caller
    Local(Box<Lock>),
    /// Lock and data both live in shared memory
    Shared(SharedMemory<Lock>),
}

/// Opaque handle
pub struct SeqlockSingleWriter {
    backing: Backing,
    data: *mut u8,
    data_size: usize,
}

impl SeqlockSingleWriter {
    fn lock(&self) -> &Lock {
        match &self.backing {
            Backing::Local(lock) => &**lock,
            Backing::Shared(shm) => &**shm,
        }
    }
}

fn set_errno(code: c_int) {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "emscripten"))]
    unsafe {
        *libc::__errno_location() = code;
    }
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe {
        *libc::__error() = code;
    }
    #[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
    unsafe {
        *libc::__errno() = code;
    }
}

fn errno_for(err: &ShmError) -> c_int {
    if let Some(code) = err.os_error().and_then(|e| e.raw_os_error()) {
        return code;
    }
    if err.is_invalid_config() {
        libc::EINVAL
    } else {
        libc::EIO
    }
}

/// Guard `size` bytes at `data` with a new lock
///
/// The buffer must outlive the handle.
///
/// # Safety
/// `data` must be valid for reads and writes of `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn seqlock_single_writer_create(
    data: *mut u8,
    size: usize,
) -> *mut SeqlockSingleWriter {
    if data.is_null() && size > 0 {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }

    Box::into_raw(Box::new(SeqlockSingleWriter {
        backing: Backing::Local(Box::new(Lock::new())),
        data,
        data_size: size,
    }))
}

/// Create or attach the shared memory object `name`
///
/// The data area holds at least `size` bytes: the lock header is added on
/// top and the total is rounded up to whole pages.
///
/// # Safety
/// `name` must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn seqlock_single_writer_create_shared(
    name: *const c_char,
    size: usize,
) -> *mut SeqlockSingleWriter {
    if name.is_null() {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }

    let name = match CStr::from_ptr(name).to_str() {
        Ok(s) => s,
        Err(_) => {
            set_errno(libc::EINVAL);
            return ptr::null_mut();
        }
    };

    let Some(total) = size.checked_add(std::mem::size_of::<Lock>()) else {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    };

    match SharedMemory::open(name, total, Lock::new) {
        Ok(opened) => {
            let shm = opened.into_inner();
            let (data, data_size) = shm.trailing_bytes();
            Box::into_raw(Box::new(SeqlockSingleWriter {
                backing: Backing::Shared(shm),
                data,
                data_size,
            }))
        }
        Err(err) => {
            error!(name, error = %err, "seqlock_single_writer_create_shared failed");
            set_errno(errno_for(&err));
            ptr::null_mut()
        }
    }
}

/// Destroy a handle
///
/// Unmaps shared memory and unlinks it if this handle created it. NULL is
/// ignored.
///
/// # Safety
/// `handle` must come from a constructor and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn seqlock_single_writer_destroy(handle: *mut SeqlockSingleWriter) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Copy up to `size` bytes of guarded data into `dst`, spinning until consistent
///
/// NULL `handle` or `dst` is ignored.
///
/// # Safety
/// `handle` must be NULL or live, `dst` valid for `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn seqlock_single_writer_load(
    handle: *mut SeqlockSingleWriter,
    dst: *mut u8,
    size: usize,
) {
    let Some(handle) = handle.as_ref() else {
        return;
    };
    if dst.is_null() {
        return;
    }
    let len = handle.data_size.min(size);
    handle
        .lock()
        .load(|| ptr::copy_nonoverlapping(handle.data as *const u8, dst, len));
}

/// Copy up to `size` bytes from `src` into the guarded data
///
/// Only one thread or process may store through a given lock. NULL `handle`
/// or `src` is ignored.
///
/// # Safety
/// `handle` must be NULL or live, `src` valid for `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn seqlock_single_writer_store(
    handle: *mut SeqlockSingleWriter,
    src: *const u8,
    size: usize,
) {
    let Some(handle) = handle.as_ref() else {
        return;
    };
    if src.is_null() {
        return;
    }
    let len = handle.data_size.min(size);
    handle
        .lock()
        .store(|| ptr::copy_nonoverlapping(src, handle.data, len));
}

/// Fill the whole guarded data with `value`
///
/// # Safety
/// `handle` must be NULL or live.
#[no_mangle]
pub unsafe extern "C" fn seqlock_single_writer_set(handle: *mut SeqlockSingleWriter, value: u8) {
    let Some(handle) = handle.as_ref() else {
        return;
    };
    handle
        .lock()
        .store(|| ptr::write_bytes(handle.data, value, handle.data_size));
}

/// Number of guarded data bytes, 0 for NULL
///
/// # Safety
/// `handle` must be NULL or live.
#[no_mangle]
pub unsafe extern "C" fn seqlock_single_writer_data_size(handle: *const SeqlockSingleWriter) -> usize {
    handle.as_ref().map_or(0, |h| h.data_size)
}

/// Whether the handle is backed by shared memory, false for NULL
///
/// # Safety
/// `handle` must be NULL or live.
#[no_mangle]
pub unsafe extern "C" fn seqlock_single_writer_is_shared(handle: *const SeqlockSingleWriter) -> bool {
    handle
        .as_ref()
        .is_some_and(|h| matches!(h.backing, Backing::Shared(_)))
}

/// Current sequence number of the lock, 0 for NULL
///
/// # Safety
/// `handle` must be NULL or live.
#[no_mangle]
pub unsafe extern "C" fn seqlock_single_writer_sequence(handle: *const SeqlockSingleWriter) -> u64 {
    handle.as_ref().map_or(0, |h| h.lock().sequence())
}
