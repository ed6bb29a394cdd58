//! Shared mappings of memfd segments.
//!
//! Unlike the receive pool (a plain read-only [`memmap2::Mmap`]), segment
//! mappings must be able to give their trailing pages back to the kernel
//! while keeping the head mapped, which needs a partial `munmap`.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::NonNull;

use crate::config::page_align;

/// A `MAP_SHARED` mapping of the first `len` bytes of a memfd.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory owned by this value; access is
// governed by the usual borrow rules on `as_slice` / `as_mut_slice`.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Maps `len` bytes of `fd` read-write, or read-only when `writable` is
    /// false.
    pub fn map(fd: BorrowedFd<'_>, len: usize, writable: bool) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        // SAFETY: a fresh mapping chosen by the kernel; the descriptor is
        // borrowed for the duration of the call only.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `len` bytes starting at `ptr` stay mapped while `self` lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` makes the access exclusive within this
        // process.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Shrinks the mapping to `len` bytes and unmaps the whole pages past it.
    pub fn truncate(&mut self, len: usize) -> io::Result<()> {
        if len >= self.len {
            return Ok(());
        }
        let keep = page_align(len);
        let mapped = page_align(self.len);
        if keep < mapped {
            // SAFETY: [keep, mapped) lies inside this mapping and nothing in
            // this process borrows it once `len` shrinks below `keep`.
            let rc = unsafe {
                libc::munmap(
                    self.ptr.as_ptr().add(keep).cast::<libc::c_void>(),
                    mapped - keep,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        self.len = len;
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let mapped = page_align(self.len);
        if mapped == 0 {
            return;
        }
        // SAFETY: unmaps exactly the range this value still owns.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), mapped) };
        if rc < 0 {
            log::warn!("munmap of {mapped} byte segment failed: {}", io::Error::last_os_error());
        }
    }
}
