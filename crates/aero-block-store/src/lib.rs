//! Backing stores for the aero block backend.
//!
//! The backend's worker threads need a *byte-addressed, positionally-vectored*
//! store interface that maps directly onto `preadv(2)`/`pwritev(2)`, because a
//! single guest request arrives as a scatter/gather list and must hit the
//! kernel as one syscall. This crate provides:
//!
//! - [`BackingStore`]: the store interface the workers drive
//! - [`FileStore`]: a regular file or raw block device on the host
//! - [`MemStore`]: RAM-backed store for tests and RAM disks
//!
//! Stores are opened once, shared across the worker pool behind an `Arc`, and
//! never resized by this crate (a host-side image may still grow underneath
//! us; [`BackingStore::capacity_bytes`] re-probes on every call).

use std::io::{self, IoSlice, IoSliceMut};

mod error;
#[cfg(unix)]
mod file;
mod mem;
#[cfg(unix)]
mod sys;

pub use error::{Result, StoreError};
#[cfg(unix)]
pub use file::{FileStore, OpenOptions};
pub use mem::MemStore;

/// Smallest sector size any store may report.
pub const MIN_SECTOR_SIZE: u32 = 512;

/// What kind of object backs a store.
///
/// Advisory: the backend only branches on this for logging. Data-path calls
/// go through the trait, and staging is driven by
/// [`BackingStore::io_alignment`], not the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Regular file on a host filesystem.
    File,
    /// Raw block device node.
    Device,
    /// Host RAM.
    Memory,
}

/// Sector geometry reported by a store, fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorGeometry {
    /// Logical sector size in bytes. Power of two, at least
    /// [`MIN_SECTOR_SIZE`].
    pub logical: u32,
    /// Physical sector size in bytes. Power of two, at least `logical`.
    pub physical: u32,
    /// Byte offset of the first physical sector boundary, for devices whose
    /// partitions start unaligned. Zero everywhere else.
    pub physical_offset: u32,
}

impl SectorGeometry {
    /// 512n geometry with no alignment offset.
    pub const DEFAULT: SectorGeometry = SectorGeometry {
        logical: MIN_SECTOR_SIZE,
        physical: MIN_SECTOR_SIZE,
        physical_offset: 0,
    };
}

/// A byte-addressed store that block-backend workers perform I/O against.
///
/// Implementations are shared across threads, so every method takes `&self`;
/// positional reads and writes carry their own offset and need no seek state.
///
/// # Partial transfers
///
/// [`read_vectored_at`](Self::read_vectored_at) and
/// [`write_vectored_at`](Self::write_vectored_at) may move fewer bytes than
/// requested, exactly like the syscalls they wrap. Callers observe the
/// returned count; they do not retry. A return of `Ok(0)` on a read means
/// end-of-store.
///
/// # Errors
///
/// Data-path methods return [`io::Result`] so callers can branch on
/// [`io::ErrorKind`]: `Interrupted` is how a blocked syscall reports that it
/// was cancelled, and `Unsupported` is how [`discard`](Self::discard)
/// distinguishes "this store cannot trim" from a hard I/O failure.
pub trait BackingStore: Send + Sync {
    /// Read into `bufs` starting at byte `offset`, returning the byte count
    /// actually read.
    fn read_vectored_at(&self, offset: u64, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize>;

    /// Write `bufs` starting at byte `offset`, returning the byte count
    /// actually written.
    fn write_vectored_at(&self, offset: u64, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Flush completed writes to stable storage.
    fn flush(&self) -> io::Result<()>;

    /// Release the byte range `[offset, offset + len)`, so that subsequent
    /// reads of it return zeroes.
    ///
    /// Stores that cannot trim fail with [`io::ErrorKind::Unsupported`].
    fn discard(&self, offset: u64, len: u64) -> io::Result<()>;

    /// Current total size in bytes.
    ///
    /// Re-probed on every call: file-backed images can be grown by the host
    /// while open.
    fn capacity_bytes(&self) -> io::Result<u64>;

    /// Sector geometry, fixed after open.
    fn geometry(&self) -> SectorGeometry;

    fn kind(&self) -> StoreKind;

    /// Whether [`discard`](Self::discard) can ever succeed on this store.
    fn supports_discard(&self) -> bool;

    /// Whether this handle fell back to (or was opened) read-only. Writes and
    /// discards against a read-only store are rejected by the caller without
    /// reaching the store.
    fn read_only(&self) -> bool;

    /// Transfer-granularity requirement, if the kernel imposes one.
    ///
    /// `Some(n)` means transfers must be staged through buffers whose size is
    /// a multiple of `n` when the request's scatter list cannot be passed
    /// through as-is (raw devices, `O_DIRECT` handles). `None` means any
    /// scatter list goes straight to the store.
    fn io_alignment(&self) -> Option<u32> {
        None
    }
}

