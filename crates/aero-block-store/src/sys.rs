//! Raw unix plumbing for [`FileStore`](crate::FileStore).
//!
//! Thin wrappers over the syscalls std does not expose: positional vectored
//! I/O, block-device geometry ioctls and the two discard mechanisms. Errors
//! come back as [`io::Error`] with the errno preserved, so `EINTR` surfaces
//! as [`io::ErrorKind::Interrupted`] exactly as the worker loop expects.

use std::fs::File;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::AsRawFd;

/// `preadv(2)`. `IoSliceMut` is ABI-compatible with `struct iovec`.
pub(crate) fn preadv(file: &File, offset: u64, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    let rc = unsafe {
        libc::preadv(
            file.as_raw_fd(),
            bufs.as_mut_ptr().cast::<libc::iovec>(),
            bufs.len() as libc::c_int,
            offset as libc::off_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// `pwritev(2)`. `IoSlice` is ABI-compatible with `struct iovec`.
pub(crate) fn pwritev(file: &File, offset: u64, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    let rc = unsafe {
        libc::pwritev(
            file.as_raw_fd(),
            bufs.as_ptr().cast::<libc::iovec>(),
            bufs.len() as libc::c_int,
            offset as libc::off_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    // Legacy `_IO(0x12, n)` request codes; spelled out because the libc crate
    // does not export all of them on every target.
    const BLKSSZGET: libc::c_ulong = 0x1268; // logical sector size (int)
    const BLKDISCARD: libc::c_ulong = 0x1277; // discard a byte range (u64[2])
    const BLKALIGNOFF: libc::c_ulong = 0x127a; // alignment offset (int)
    const BLKPBSZGET: libc::c_ulong = 0x127b; // physical sector size (uint)

    fn ioctl_ok(rc: libc::c_int) -> io::Result<()> {
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Logical sector, physical sector and alignment offset of a block
    /// device, in bytes.
    pub(crate) fn block_device_geometry(file: &File) -> io::Result<(u32, u32, u32)> {
        let fd = file.as_raw_fd();
        let mut logical: libc::c_int = 0;
        let mut physical: libc::c_uint = 0;
        let mut align_off: libc::c_int = 0;
        unsafe {
            ioctl_ok(libc::ioctl(fd, BLKSSZGET as _, &mut logical))?;
            ioctl_ok(libc::ioctl(fd, BLKPBSZGET as _, &mut physical))?;
            ioctl_ok(libc::ioctl(fd, BLKALIGNOFF as _, &mut align_off))?;
        }
        // A negative alignment offset means the kernel could not determine
        // one; treat it as aligned.
        Ok((logical as u32, physical, align_off.max(0) as u32))
    }

    /// `BLKDISCARD`: trim a byte range of a block device.
    pub(crate) fn block_device_discard(file: &File, offset: u64, len: u64) -> io::Result<()> {
        let range: [u64; 2] = [offset, len];
        unsafe { ioctl_ok(libc::ioctl(file.as_raw_fd(), BLKDISCARD as _, range.as_ptr())) }
    }

    /// `fallocate(PUNCH_HOLE | KEEP_SIZE)`: deallocate a byte range of a
    /// regular file so reads of it return zeroes.
    pub(crate) fn punch_hole(file: &File, offset: u64, len: u64) -> io::Result<()> {
        let rc = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(target_os = "linux")]
pub(crate) use linux::{block_device_discard, block_device_geometry, punch_hole};

#[cfg(all(unix, not(target_os = "linux")))]
mod fallback {
    use super::*;

    pub(crate) fn block_device_geometry(_file: &File) -> io::Result<(u32, u32, u32)> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "block device geometry probing is only implemented on Linux",
        ))
    }

    pub(crate) fn block_device_discard(_file: &File, _offset: u64, _len: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "block device discard is only implemented on Linux",
        ))
    }

    pub(crate) fn punch_hole(_file: &File, _offset: u64, _len: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "hole punching is only implemented on Linux",
        ))
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) use fallback::{block_device_discard, block_device_geometry, punch_hole};
