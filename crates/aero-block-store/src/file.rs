//! Host file and raw block device stores.

use std::fs::File;
use std::io::{self, IoSlice, IoSliceMut, Seek, SeekFrom};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::sys;
use crate::{BackingStore, SectorGeometry, StoreKind, MIN_SECTOR_SIZE};

/// Options for [`FileStore::open`].
///
/// Mirrors the knobs a VM configuration exposes per disk. All default to off
/// except `discard`, which is on and simply has no effect on stores that
/// cannot trim.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Open read-only. Note that a read-write open that fails with a
    /// permission error falls back to read-only on its own; see
    /// [`FileStore::open`].
    pub read_only: bool,
    /// Bypass the host page cache (`O_DIRECT`). Linux only; transfers are
    /// then staged through sector-aligned buffers.
    pub no_cache: bool,
    /// Make every write synchronous (`O_SYNC`).
    pub write_sync: bool,
    /// Allow discard requests to reach the store. When off, discards fail
    /// with [`io::ErrorKind::Unsupported`].
    pub discard: bool,
    /// Override the logical sector size reported to the guest. Must be a
    /// power of two, at least 512, and on a block device a multiple of the
    /// device's own logical sector size.
    pub sector_size: Option<u32>,
    /// Override the physical sector size. Requires `sector_size`; defaults
    /// to it when unset.
    pub physical_sector_size: Option<u32>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            read_only: false,
            no_cache: false,
            write_sync: false,
            discard: true,
            sector_size: None,
            physical_sector_size: None,
        }
    }
}

/// A store backed by a regular file or a raw block device node.
///
/// The file descriptor is shared by every worker thread; all I/O is
/// positional, so no seek state is involved. See [`FileStore::open`] for the
/// probing and validation performed up front.
pub struct FileStore {
    file: File,
    path: PathBuf,
    kind: StoreKind,
    geometry: SectorGeometry,
    read_only: bool,
    discard_enabled: bool,
    // Sector-granular staging requirement: set for device nodes and for
    // O_DIRECT handles.
    io_alignment: Option<u32>,
}

impl FileStore {
    /// Open `path` and probe its geometry.
    ///
    /// A read-write open that fails with `EPERM`/`EACCES`/`EROFS` is retried
    /// read-only, and the resulting store reports
    /// [`read_only`](BackingStore::read_only); submitting writes to it is the
    /// caller's error, reported per-request without touching the store.
    ///
    /// Regular files report a 512-byte logical sector and the filesystem's
    /// preferred block size as the physical sector. Block devices are probed
    /// for logical/physical sector size and alignment offset. Both probes can
    /// be overridden via [`OpenOptions::sector_size`], subject to validation.
    pub fn open(path: impl AsRef<Path>, opts: &OpenOptions) -> Result<FileStore> {
        let path = path.as_ref();

        let mut flags = 0;
        if opts.no_cache {
            #[cfg(target_os = "linux")]
            {
                flags |= libc::O_DIRECT;
            }
            #[cfg(not(target_os = "linux"))]
            return Err(StoreError::InvalidConfig(
                "no_cache (O_DIRECT) is only supported on Linux",
            ));
        }
        if opts.write_sync {
            flags |= libc::O_SYNC;
        }

        let mut read_only = opts.read_only;
        let file = if read_only {
            open_file(path, false, flags)?
        } else {
            match open_file(path, true, flags) {
                Ok(file) => file,
                Err(StoreError::Open(err)) if is_permission_error(&err) => {
                    read_only = true;
                    open_file(path, false, flags)?
                }
                Err(err) => return Err(err),
            }
        };

        let meta = file.metadata().map_err(StoreError::Probe)?;
        let file_type = meta.file_type();
        let kind = if file_type.is_file() {
            StoreKind::File
        } else if file_type.is_block_device() {
            StoreKind::Device
        } else {
            return Err(StoreError::UnsupportedType(if file_type.is_char_device() {
                "character device"
            } else if file_type.is_dir() {
                "directory"
            } else {
                "not a regular file or block device"
            }));
        };

        let probed = if kind == StoreKind::Device {
            let (logical, physical, physical_offset) =
                sys::block_device_geometry(&file).map_err(StoreError::Probe)?;
            SectorGeometry {
                logical: logical.max(MIN_SECTOR_SIZE),
                physical: physical.max(logical).max(MIN_SECTOR_SIZE),
                physical_offset,
            }
        } else {
            let blksize = u32::try_from(meta.blksize()).unwrap_or(MIN_SECTOR_SIZE);
            let physical = if blksize.is_power_of_two() && blksize >= MIN_SECTOR_SIZE {
                blksize
            } else {
                MIN_SECTOR_SIZE
            };
            SectorGeometry {
                logical: MIN_SECTOR_SIZE,
                physical,
                physical_offset: 0,
            }
        };

        let geometry = apply_sector_override(probed, kind, opts)?;

        let io_alignment = if kind == StoreKind::Device || opts.no_cache {
            Some(geometry.logical)
        } else {
            None
        };

        Ok(FileStore {
            file,
            path: path.to_path_buf(),
            kind,
            geometry,
            read_only,
            discard_enabled: opts.discard && !read_only,
            io_alignment,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_file(path: &Path, write: bool, flags: i32) -> Result<File> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(write)
        .custom_flags(flags)
        .open(path)
        .map_err(StoreError::Open)
}

fn is_permission_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EPERM) | Some(libc::EACCES) | Some(libc::EROFS)
    )
}

fn apply_sector_override(
    probed: SectorGeometry,
    kind: StoreKind,
    opts: &OpenOptions,
) -> Result<SectorGeometry> {
    let logical = match opts.sector_size {
        Some(logical) => logical,
        None => {
            if opts.physical_sector_size.is_some() {
                return Err(StoreError::InvalidConfig(
                    "physical_sector_size requires sector_size",
                ));
            }
            return Ok(probed);
        }
    };
    let physical = opts.physical_sector_size.unwrap_or(logical);

    for size in [logical, physical] {
        if !size.is_power_of_two() || size < MIN_SECTOR_SIZE {
            return Err(StoreError::InvalidSectorSize(size));
        }
    }
    if logical > physical {
        return Err(StoreError::SectorSizeMismatch { logical, physical });
    }
    // The kernel will reject direct transfers below the device's own sector
    // granularity, so the override may only coarsen it.
    if kind == StoreKind::Device && !logical.is_multiple_of(probed.logical) {
        return Err(StoreError::SectorSizeNotDeviceMultiple {
            requested: logical,
            device: probed.logical,
        });
    }

    Ok(SectorGeometry {
        logical,
        physical,
        physical_offset: if kind == StoreKind::Device {
            probed.physical_offset
        } else {
            0
        },
    })
}

impl BackingStore for FileStore {
    fn read_vectored_at(&self, offset: u64, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        sys::preadv(&self.file, offset, bufs)
    }

    fn write_vectored_at(&self, offset: u64, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        sys::pwritev(&self.file, offset, bufs)
    }

    fn flush(&self) -> io::Result<()> {
        // fsync on a block device node flushes the device write cache.
        self.file.sync_all()
    }

    fn discard(&self, offset: u64, len: u64) -> io::Result<()> {
        if !self.discard_enabled {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "discard disabled for this store",
            ));
        }
        if self.kind == StoreKind::Device {
            sys::block_device_discard(&self.file, offset, len)
        } else {
            sys::punch_hole(&self.file, offset, len)
        }
    }

    fn capacity_bytes(&self) -> io::Result<u64> {
        if self.kind == StoreKind::Device {
            // Block devices report st_size 0; the seek end is authoritative.
            // Positional I/O never touches the fd's file position, so moving
            // it here is safe.
            (&self.file).seek(SeekFrom::End(0))
        } else {
            self.file.metadata().map(|meta| meta.len())
        }
    }

    fn geometry(&self) -> SectorGeometry {
        self.geometry
    }

    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn supports_discard(&self) -> bool {
        // Configuration-level answer. Filesystem or device support is only
        // discoverable by issuing a discard; an unsupporting store fails the
        // request with `Unsupported`.
        self.discard_enabled
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn io_alignment(&self) -> Option<u32> {
        self.io_alignment
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("geometry", &self.geometry)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}
