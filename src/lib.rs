//! seqlock_shm - Sequence locks over named shared memory
//!
//! Low-latency publishing of an in-place updated block of memory from one or
//! more writers to many readers, within a process or across processes.
//!
//! # Architecture
//!
//! - **SeqLock**: optimistic reads, wait-free single writer, spin-serialized
//!   multi writer. Readers never delay writers.
//! - **SharedRegion**: `N` inline bytes plus a `SeqLock`, pointer-free so it
//!   can live in shared memory.
//! - **SharedMemory**: create-or-attach a named POSIX shared memory object and
//!   place a payload in it exactly once.
//!
//! ```no_run
//! use seqlock_shm::{SharedMemory, SingleWriterRegion};
//!
//! # fn main() -> seqlock_shm::ShmResult<()> {
//! type Region = SingleWriterRegion<1024>;
//!
//! let region = SharedMemory::open("/sensor", 0, Region::new)?.into_inner();
//! region.set(42);
//!
//! let mut buf = [0u8; 1024];
//! region.load(&mut buf);
//! # Ok(())
//! # }
//! ```
//!
//! # Performance
//!
//! - Single-writer store: two relaxed stores, a barrier and a release store
//! - Load: retried until no write overlapped it; cost independent of reader count

pub mod bindings;
pub mod error;
pub mod region;
pub mod seqlock;
pub mod shm;
pub mod spinlock;

pub use error::{ShmError, ShmResult};
pub use region::{MultiWriterRegion, SharedRegion, SingleWriterRegion};
pub use seqlock::{Mode, MultiWriter, SeqLock, SingleWriter};
pub use shm::{Opened, Role, Segment, SegmentOptions, SharedMemory, ShmSafe};
pub use spinlock::SpinLock;
