// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Anonymous shared memory segment management.
//!
//! Unlike a named POSIX `shm_open` segment, a [`MemfdSegment`] has no
//! filesystem presence to discover by name: the producer creates it with
//! `memfd_create(2)`, and the consumer attaches to the exact same region by
//! receiving the file descriptor over [`crate::scm`]. There is therefore no
//! unlink step in this design's lifecycle — once every process holding a
//! reference to the descriptor exits (or closes it), the kernel reclaims
//! the memory on its own.

use crate::error::{InitError, Result};
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// An anonymous shared memory mapping backed by a `memfd_create` file
/// descriptor.
///
/// Automatically unmaps the memory region on drop. The backing descriptor
/// is closed on drop too (an [`OwnedFd`]); the kernel keeps the underlying
/// memory alive as long as any mapping or descriptor referencing it
/// survives in any process.
pub struct MemfdSegment {
    ptr: *mut u8,
    size: usize,
    fd: OwnedFd,
}

// SAFETY: the mapped region is shared memory synchronized purely through
// atomics defined in `crate::layout`; the pointer itself carries no
// thread-local state.
unsafe impl Send for MemfdSegment {}
unsafe impl Sync for MemfdSegment {}

impl MemfdSegment {
    /// Create a new anonymous shared memory segment of `size` bytes,
    /// zero-initialized.
    pub fn create(size: usize) -> Result<Self> {
        let name = CString::new("memwheel").expect("no interior NUL");

        // SAFETY: name is a valid null-terminated CString; MFD_CLOEXEC is a
        // valid flag. memfd_create returns a valid owned fd on success or
        // -1 on error (checked below).
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(InitError::SegmentCreate(io::Error::last_os_error()));
        }
        // SAFETY: fd is a valid, just-created file descriptor we uniquely own.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: fd is valid and size fits in off_t for any realistic wheel size.
        let ret = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
        if ret < 0 {
            return Err(InitError::SegmentCreate(io::Error::last_os_error()));
        }

        log::debug!("[memwheel] created {}-byte anonymous segment", size);
        Self::map(fd, size, true)
    }

    /// Attach to an existing segment via a received file descriptor,
    /// typically one obtained through [`crate::scm::recv_handles`].
    ///
    /// The segment is NOT zero-initialized (it belongs to the producer,
    /// which already initialized the wheel header in it).
    pub fn from_fd(fd: RawFd, size: usize) -> Result<Self> {
        // SAFETY: caller guarantees fd is a valid, owned descriptor
        // received over SCM_RIGHTS (ownership transfers to us).
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::map(fd, size, false)
    }

    fn map(fd: OwnedFd, size: usize, zero_init: bool) -> Result<Self> {
        // SAFETY: fd is valid and open for read/write; size is the caller's
        // requested mapping length; MAP_SHARED makes writes visible to
        // other processes mapping the same descriptor.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(InitError::Mmap(io::Error::last_os_error()));
        }

        if zero_init {
            // SAFETY: ptr is a valid, exclusively-held mapping of `size`
            // bytes just created by mmap above.
            unsafe {
                ptr::write_bytes(ptr as *mut u8, 0, size);
            }
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            fd,
        })
    }

    /// Raw pointer to the start of the mapped memory.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The backing file descriptor, suitable for duplicating over
    /// `SCM_RIGHTS` to another process.
    #[inline]
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for MemfdSegment {
    fn drop(&mut self) {
        // SAFETY: self.ptr/self.size were obtained from a successful mmap
        // in `map`, and this is the only place that unmaps them.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_zero_initializes() {
        let seg = MemfdSegment::create(4096).expect("create");
        // SAFETY: seg is freshly created with size 4096.
        let byte = unsafe { *seg.as_ptr() };
        assert_eq!(byte, 0);
    }

    #[test]
    fn from_fd_attaches_to_same_memory() {
        let seg1 = MemfdSegment::create(4096).expect("create");
        // SAFETY: offset 0 is within the 4096-byte mapping.
        unsafe {
            *seg1.as_ptr() = 0x42;
        }

        // dup so seg2 owns an independent fd, as a received SCM_RIGHTS fd would be
        let dup_fd = unsafe { libc::dup(seg1.as_raw_fd()) };
        assert!(dup_fd >= 0);
        let seg2 = MemfdSegment::from_fd(dup_fd, 4096).expect("attach");

        // SAFETY: both map the same underlying memfd.
        unsafe {
            assert_eq!(*seg2.as_ptr(), 0x42);
        }
    }
}
