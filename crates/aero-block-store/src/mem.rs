//! RAM-backed store.

use std::io::{self, IoSlice, IoSliceMut};
use std::sync::RwLock;

use crate::{BackingStore, SectorGeometry, StoreKind};

/// A fixed-capacity store held in host RAM.
///
/// Behaves like a small raw device: reads past the end return short counts
/// (zero at the end), writes past the end fail with
/// [`io::ErrorKind::StorageFull`], discard zero-fills. Used as a RAM disk and
/// throughout the test suites.
#[derive(Debug)]
pub struct MemStore {
    data: RwLock<Vec<u8>>,
    read_only: bool,
}

impl MemStore {
    /// Zero-filled store of `capacity` bytes.
    pub fn new(capacity: usize) -> MemStore {
        MemStore::from_bytes(vec![0; capacity])
    }

    /// Store over an existing image.
    pub fn from_bytes(data: Vec<u8>) -> MemStore {
        MemStore {
            data: RwLock::new(data),
            read_only: false,
        }
    }

    /// Mark the store read-only. The backend then fails writes and discards
    /// per-request without calling into the store.
    pub fn read_only(mut self) -> MemStore {
        self.read_only = true;
        self
    }

    fn data(&self) -> std::sync::RwLockReadGuard<'_, Vec<u8>> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn data_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BackingStore for MemStore {
    fn read_vectored_at(&self, offset: u64, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let data = self.data();
        let Some(mut pos) = checked_pos(offset, data.len()) else {
            return Ok(0);
        };
        let mut copied = 0;
        for buf in bufs {
            let n = buf.len().min(data.len() - pos);
            buf[..n].copy_from_slice(&data[pos..pos + n]);
            pos += n;
            copied += n;
            if pos == data.len() {
                break;
            }
        }
        Ok(copied)
    }

    fn write_vectored_at(&self, offset: u64, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut data = self.data_mut();
        let len = data.len();
        let Some(mut pos) = checked_pos(offset, len) else {
            return Err(io::Error::new(
                io::ErrorKind::StorageFull,
                "write past end of store",
            ));
        };
        let mut copied = 0;
        for buf in bufs {
            let n = buf.len().min(len - pos);
            data[pos..pos + n].copy_from_slice(&buf[..n]);
            pos += n;
            copied += n;
            if pos == len {
                break;
            }
        }
        Ok(copied)
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn discard(&self, offset: u64, len: u64) -> io::Result<()> {
        let mut data = self.data_mut();
        let capacity = data.len();
        let Some(start) = checked_pos(offset, capacity) else {
            return Ok(());
        };
        let end = len
            .checked_add(offset)
            .map(|end| end.min(capacity as u64) as usize)
            .unwrap_or(capacity);
        data[start..end].fill(0);
        Ok(())
    }

    fn capacity_bytes(&self) -> io::Result<u64> {
        Ok(self.data().len() as u64)
    }

    fn geometry(&self) -> SectorGeometry {
        SectorGeometry::DEFAULT
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    fn supports_discard(&self) -> bool {
        !self.read_only
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}

/// `offset` as an index into a `len`-byte store, or `None` when at/past the
/// end.
fn checked_pos(offset: u64, len: usize) -> Option<usize> {
    match usize::try_from(offset) {
        Ok(pos) if pos < len => Some(pos),
        _ => None,
    }
}
