//! Named POSIX shared memory segments
//!
//! [`Segment`] is the raw mapping: create-or-attach by name, page-rounded
//! size, unmap on drop and unlink if this handle created the name.
//! [`SharedMemory<T>`] places a [`ShmSafe`] payload at the start of a segment:
//! the creator constructs it exactly once, attachers reinterpret the existing
//! bytes. Which of the two happened is reported through [`Opened`].

use crate::error::{ShmError, ShmResult};
use crate::region::SharedRegion;
use crate::seqlock::{Mode, SeqLock};
use crate::spinlock::SpinLock;
use rustix::fd::OwnedFd;
use rustix::fs::{flock, fstat, ftruncate, FlockOperation};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode as Permissions, ShmOFlags};
use std::fmt;
use std::io;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicU64};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Longest accepted segment name, leading `/` included (`NAME_MAX`)
pub const MAX_NAME_LEN: usize = 255;

const UNIQUE_PREFIX: &str = "/shm-";

/// System page size in bytes
#[inline]
pub fn page_size() -> usize {
    rustix::param::page_size()
}

/// Round `size` up to a whole number of pages
///
/// `0` rounds to exactly one page, exact multiples are returned unchanged.
pub fn round_to_page_size(size: usize) -> ShmResult<usize> {
    round_up(size, page_size())
}

fn round_up(size: usize, page_size: usize) -> ShmResult<usize> {
    if size == 0 {
        return Ok(page_size);
    }
    match size % page_size {
        0 => Ok(size),
        remainder => size
            .checked_add(page_size - remainder)
            .ok_or(ShmError::SizeOverflow { size, page_size }),
    }
}

/// Check that `name` has the form `/name`
pub fn validate_name(name: &str) -> ShmResult<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.len() > MAX_NAME_LEN {
        "name is longer than 255 bytes"
    } else if !name.starts_with('/') {
        "name must start with '/'"
    } else if name.len() == 1 {
        "name has nothing after '/'"
    } else if name[1..].contains('/') {
        "name must not contain '/' after the first character"
    } else if name.contains('\0') {
        "name contains a NUL byte"
    } else {
        return Ok(());
    };

    Err(ShmError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// Types whose bytes can be shared verbatim between address spaces
///
/// # Safety
/// Implementors must contain no pointers, references or handles to
/// process-local resources, must be usable through `&self` from several
/// threads (`Sync`), and the all-zero byte image must be a valid value.
pub unsafe trait ShmSafe: Sync {}

macro_rules! impl_shm_safe {
    ($($ty:ty),* $(,)?) => {
        $(unsafe impl ShmSafe for $ty {})*
    };
}

impl_shm_safe!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool,
    atomic::AtomicBool, atomic::AtomicU8, atomic::AtomicU16, atomic::AtomicU32,
    atomic::AtomicU64, atomic::AtomicUsize, atomic::AtomicI8, atomic::AtomicI16,
    atomic::AtomicI32, atomic::AtomicI64, atomic::AtomicIsize,
);

unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}
unsafe impl ShmSafe for SpinLock {}
unsafe impl<M: Mode> ShmSafe for SeqLock<M> {}
unsafe impl<M: Mode, const N: usize> ShmSafe for SharedRegion<M, N> {}

/// Which side of the create/attach race a handle ended up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created the name, constructs the payload, unlinks the name on teardown
    Creator,
    /// Mapped an object somebody else created
    Attacher,
}

/// Called with errors that happen while a segment is dropped
pub type TeardownHandler = Arc<dyn Fn(&ShmError) + Send + Sync>;

/// Options for opening a segment
#[derive(Clone)]
pub struct SegmentOptions {
    /// Permission bits of a newly created object
    pub permissions: Permissions,
    /// Hold a `flock` while the creator sizes, maps and initializes
    pub advisory_lock: bool,
    /// Receives teardown errors from `Drop`; `None` logs them
    pub teardown_handler: Option<TeardownHandler>,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            permissions: Permissions::RUSR | Permissions::WUSR | Permissions::RGRP | Permissions::WGRP,
            advisory_lock: true,
            teardown_handler: None,
        }
    }
}

impl SegmentOptions {
    /// Set the permission bits used on creation
    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Enable or disable the advisory creation lock
    pub fn with_advisory_lock(mut self, enabled: bool) -> Self {
        self.advisory_lock = enabled;
        self
    }

    /// Route teardown errors to `handler`
    pub fn with_teardown_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ShmError) + Send + Sync + 'static,
    {
        self.teardown_handler = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for SegmentOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentOptions")
            .field("permissions", &self.permissions)
            .field("advisory_lock", &self.advisory_lock)
            .field("teardown_handler", &self.teardown_handler.is_some())
            .finish()
    }
}

/// Handle to a mapped shared memory object
pub struct Segment {
    addr: NonNull<u8>,
    size: usize,
    name: String,
    role: Role,
    mapped: bool,
    unlinked: bool,
    teardown_handler: Option<TeardownHandler>,
}

// SAFETY: the handle only carries the mapping address; access to the bytes
// is synchronized by whatever lives inside the segment.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create `name` or attach to it
    ///
    /// `size` is rounded up to whole pages. A creator gets a zero-filled
    /// object of that size; an attacher requires the existing object to have
    /// exactly that size.
    pub fn open(name: &str, size: usize, options: &SegmentOptions) -> ShmResult<Self> {
        Self::open_impl(name, size, options, |_| {})
    }

    /// Create a segment under a fresh `/shm-<pid>-<nanos>-<n>` name
    pub fn create_unique(size: usize, options: &SegmentOptions) -> ShmResult<Self> {
        Self::open(&Self::unique_name(), size, options)
    }

    /// A name no other live segment of this process uses
    pub fn unique_name() -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let n = COUNTER.fetch_add(1, atomic::Ordering::Relaxed);
        format!("{}{}-{}-{}", UNIQUE_PREFIX, std::process::id(), nanos, n)
    }

    /// Remove a name left behind by a crashed creator
    pub fn remove(name: &str) -> ShmResult<()> {
        validate_name(name)?;
        shm_unlink(name).map_err(|e| ShmError::Unlink {
            name: name.to_string(),
            source: e.into(),
        })
    }

    /// Shared by `open` and `SharedMemory::open_with`. `init` runs only for
    /// the creator, after mapping and while the advisory lock is held.
    fn open_impl(
        name: &str,
        size: usize,
        options: &SegmentOptions,
        init: impl FnOnce(NonNull<u8>),
    ) -> ShmResult<Self> {
        validate_name(name)?;
        if size == 0 {
            return Err(ShmError::InvalidSize { size });
        }
        let size = round_to_page_size(size)?;

        let (addr, role) = match shm_open(
            name,
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            options.permissions,
        ) {
            Ok(fd) => (Self::init_created(name, fd, size, options, init)?, Role::Creator),
            Err(e) if e == Errno::EXIST => {
                (Self::map_existing(name, size, options)?, Role::Attacher)
            }
            Err(e) => {
                return Err(ShmError::Create {
                    name: name.to_string(),
                    source: e.into(),
                })
            }
        };

        debug!(name, size, ?role, "mapped shared memory segment");

        Ok(Self {
            addr,
            size,
            name: name.to_string(),
            role,
            mapped: true,
            unlinked: false,
            teardown_handler: options.teardown_handler.clone(),
        })
    }

    fn init_created(
        name: &str,
        fd: OwnedFd,
        size: usize,
        options: &SegmentOptions,
        init: impl FnOnce(NonNull<u8>),
    ) -> ShmResult<NonNull<u8>> {
        // Attachers take the shared lock before looking at the size, so they
        // cannot map the object between ftruncate and init.
        let locked = options.advisory_lock && lock_file(&fd, FlockOperation::LockExclusive, name);

        let result = resize_and_map(&fd, name, size).map(|addr| {
            init(addr);
            addr
        });

        if locked {
            unlock_file(&fd, name);
        }

        if result.is_err() {
            // no half-initialized object may stay reachable by name
            if let Err(e) = shm_unlink(name) {
                debug!(name, error = %e, "failed to unlink after failed creation");
            }
        }
        result
    }

    fn map_existing(name: &str, size: usize, options: &SegmentOptions) -> ShmResult<NonNull<u8>> {
        let fd = shm_open(name, ShmOFlags::RDWR, Permissions::empty()).map_err(|e| {
            ShmError::Open {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        let locked = options.advisory_lock && lock_file(&fd, FlockOperation::LockShared, name);
        let result = check_size_and_map(&fd, name, size);
        if locked {
            unlock_file(&fd, name);
        }
        result
    }

    /// Get raw pointer to the start of the mapping
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Mapped size in bytes, a multiple of the page size
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Name of the shared memory object
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the object
    #[inline(always)]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Check if this handle created the object
    #[inline(always)]
    pub fn is_creator(&self) -> bool {
        self.role == Role::Creator
    }

    /// Place a `T` at the start of the mapping
    ///
    /// The creator writes `init()`; an attacher reinterprets the bytes and
    /// never calls `init`. Unlike [`SharedMemory::open`] the construction
    /// happens after the advisory lock was released, so attachers racing
    /// with this call may see the zero-filled image first.
    pub fn place<T: ShmSafe>(self, init: impl FnOnce() -> T) -> ShmResult<Opened<T>> {
        check_layout::<T>(self.size)?;

        let payload = self.addr.cast::<T>();
        if self.is_creator() {
            // SAFETY: mapping is page aligned, large enough and writable
            unsafe { payload.as_ptr().write(init()) };
        }
        Ok(Opened::tag(SharedMemory {
            segment: self,
            payload,
        }))
    }

    /// Unmap, and unlink if this handle is the creator
    ///
    /// Reports the first failure. Dropping a segment does the same but hands
    /// errors to the teardown handler instead.
    pub fn close(mut self) -> ShmResult<()> {
        self.release()
    }

    /// Idempotent: each step runs at most once per handle.
    fn release(&mut self) -> ShmResult<()> {
        let mut first_error = None;

        if self.mapped {
            self.mapped = false;
            // SAFETY: addr/size describe our own live mapping
            match unsafe { munmap(self.addr.as_ptr().cast(), self.size) } {
                Ok(()) => debug!(name = %self.name, "unmapped shared memory segment"),
                Err(e) => {
                    first_error = Some(ShmError::Unmap {
                        name: self.name.clone(),
                        source: e.into(),
                    })
                }
            }
        }

        if self.is_creator() && !self.unlinked {
            self.unlinked = true;
            match shm_unlink(self.name.as_str()) {
                Ok(()) => debug!(name = %self.name, "unlinked shared memory segment"),
                Err(e) => {
                    first_error.get_or_insert(ShmError::Unlink {
                        name: self.name.clone(),
                        source: e.into(),
                    });
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            match &self.teardown_handler {
                Some(handler) => handler(&err),
                None => warn!(name = %self.name, error = %err, "shared memory teardown failed"),
            }
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("role", &self.role)
            .field("mapped", &self.mapped)
            .finish()
    }
}

fn resize_and_map(fd: &OwnedFd, name: &str, size: usize) -> ShmResult<NonNull<u8>> {
    ftruncate(fd, size as u64).map_err(|e| ShmError::Truncate {
        name: name.to_string(),
        source: e.into(),
    })?;
    map(fd, name, size)
}

fn check_size_and_map(fd: &OwnedFd, name: &str, size: usize) -> ShmResult<NonNull<u8>> {
    let stat = fstat(fd).map_err(|e| ShmError::Stat {
        name: name.to_string(),
        source: e.into(),
    })?;

    let actual = stat.st_size as usize;
    if actual != size {
        return Err(ShmError::SizeMismatch {
            name: name.to_string(),
            expected: size,
            actual,
        });
    }
    map(fd, name, size)
}

fn map(fd: &OwnedFd, name: &str, size: usize) -> ShmResult<NonNull<u8>> {
    // SAFETY: fresh shared mapping of an fd we own, no existing memory is touched
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|e| ShmError::Map {
        name: name.to_string(),
        source: e.into(),
    })?;

    NonNull::new(addr.cast::<u8>()).ok_or_else(|| ShmError::Map {
        name: name.to_string(),
        source: io::Error::new(io::ErrorKind::Other, "mmap returned null"),
    })
}

/// Returns whether the lock was taken. Filesystems without `flock` support
/// just lose the bracket.
fn lock_file(fd: &OwnedFd, operation: FlockOperation, name: &str) -> bool {
    match flock(fd, operation) {
        Ok(()) => true,
        Err(e) => {
            debug!(name, error = %e, "advisory lock unavailable");
            false
        }
    }
}

fn unlock_file(fd: &OwnedFd, name: &str) {
    if let Err(e) = flock(fd, FlockOperation::Unlock) {
        debug!(name, error = %e, "failed to release advisory lock");
    }
}

fn check_alignment<T>() -> ShmResult<()> {
    let page_size = page_size();
    let align = std::mem::align_of::<T>();
    if align > page_size {
        return Err(ShmError::Alignment { align, page_size });
    }
    Ok(())
}

fn check_layout<T>(available: usize) -> ShmResult<()> {
    check_alignment::<T>()?;
    let required = std::mem::size_of::<T>();
    if required > available {
        return Err(ShmError::CapacityTooSmall {
            required,
            available,
        });
    }
    Ok(())
}

/// A segment holding a `T` at offset 0
///
/// Dereferences to the payload. All handles to the same name, in any
/// process, see the same `T`.
pub struct SharedMemory<T: ShmSafe> {
    segment: Segment,
    payload: NonNull<T>,
}

// SAFETY: T is Sync and lives as long as the mapping owned by `segment`
unsafe impl<T: ShmSafe> Send for SharedMemory<T> {}
unsafe impl<T: ShmSafe> Sync for SharedMemory<T> {}

impl<T: ShmSafe> SharedMemory<T> {
    /// Create-or-attach `name` with default options
    ///
    /// See [`SharedMemory::open_with`].
    pub fn open(name: &str, size: usize, init: impl FnOnce() -> T) -> ShmResult<Opened<T>> {
        Self::open_with(name, size, &SegmentOptions::default(), init)
    }

    /// Create-or-attach `name` and place a `T` in it
    ///
    /// The mapping holds `max(size, size_of::<T>())` bytes rounded up to
    /// whole pages. Only the creator calls `init`, while still holding the
    /// advisory lock; attachers reuse the creator's value as is.
    pub fn open_with(
        name: &str,
        size: usize,
        options: &SegmentOptions,
        init: impl FnOnce() -> T,
    ) -> ShmResult<Opened<T>> {
        check_alignment::<T>()?;
        let size = size.max(std::mem::size_of::<T>());

        let segment = Segment::open_impl(name, size, options, |addr| {
            // SAFETY: fresh page aligned mapping of at least size_of::<T>() bytes
            unsafe { addr.cast::<T>().as_ptr().write(init()) }
        })?;

        let payload = segment.addr.cast::<T>();
        Ok(Opened::tag(SharedMemory { segment, payload }))
    }

    /// The underlying segment
    #[inline(always)]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Name of the shared memory object
    #[inline(always)]
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Mapped size in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.segment.size()
    }

    /// Whether this handle created the object
    #[inline(always)]
    pub fn role(&self) -> Role {
        self.segment.role()
    }

    /// Check if this handle created the object
    #[inline(always)]
    pub fn is_creator(&self) -> bool {
        self.segment.is_creator()
    }

    /// Bytes of the mapping that follow the payload
    ///
    /// Returns the start pointer and the length. Any synchronization of
    /// these bytes is up to the caller.
    #[inline]
    pub fn trailing_bytes(&self) -> (*mut u8, usize) {
        let offset = std::mem::size_of::<T>();
        // SAFETY: offset <= size, checked when the payload was placed
        let ptr = unsafe { self.segment.as_ptr().add(offset) };
        (ptr, self.segment.size() - offset)
    }

    /// Unmap, and unlink if creator. See [`Segment::close`].
    pub fn close(self) -> ShmResult<()> {
        self.segment.close()
    }
}

impl<T: ShmSafe> Deref for SharedMemory<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: constructed by the creator, mapping lives as long as self
        unsafe { self.payload.as_ref() }
    }
}

impl<T: ShmSafe> fmt::Debug for SharedMemory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("segment", &self.segment)
            .field("payload", &std::any::type_name::<T>())
            .finish()
    }
}

/// Result of a create-or-attach
#[derive(Debug)]
pub enum Opened<T: ShmSafe> {
    /// This call created the object and constructed the payload
    Created(SharedMemory<T>),
    /// The object already existed; the payload was reused
    Attached(SharedMemory<T>),
}

impl<T: ShmSafe> Opened<T> {
    fn tag(shm: SharedMemory<T>) -> Self {
        match shm.role() {
            Role::Creator => Opened::Created(shm),
            Role::Attacher => Opened::Attached(shm),
        }
    }

    /// Which side of the race this handle is on
    pub fn role(&self) -> Role {
        match self {
            Opened::Created(_) => Role::Creator,
            Opened::Attached(_) => Role::Attacher,
        }
    }

    /// Check if this call created the object
    pub fn is_creator(&self) -> bool {
        matches!(self, Opened::Created(_))
    }

    /// Drop the tag
    pub fn into_inner(self) -> SharedMemory<T> {
        match self {
            Opened::Created(shm) | Opened::Attached(shm) => shm,
        }
    }
}
