//! Kernel call boundary.
//!
//! Every system call this crate issues against the bus goes through
//! [`Kernel`] (per connection) or [`ControlDevice`] (bus administration).
//! [`crate::dev`] implements both on top of `/dev/kdbus`; tests substitute an
//! in-process bus.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;

use kdbus_wire::{HelloCmd, KmsgBuf, MakeCmd};

/// One open bus endpoint. Send and receive share this handle.
pub trait Kernel {
    /// Descriptor whose first `pool_size` bytes are the receive pool.
    fn pool_fd(&self) -> BorrowedFd<'_>;

    /// Issues the hello; the kernel writes its reply into `cmd`.
    fn hello(&self, cmd: &mut HelloCmd) -> io::Result<()>;

    fn send(&self, kmsg: &KmsgBuf) -> io::Result<()>;

    /// Dequeues the next message and returns its offset inside the pool.
    fn recv(&self) -> io::Result<u64>;

    /// Returns a received message's pool space to the kernel.
    fn free(&self, offset: u64) -> io::Result<()>;

    fn memfd_new(&self) -> io::Result<OwnedFd>;

    fn memfd_set_size(&self, memfd: BorrowedFd<'_>, size: u64) -> io::Result<()>;

    fn memfd_seal(&self, memfd: BorrowedFd<'_>, sealed: bool) -> io::Result<()>;

    fn monitor(&self, enable: bool) -> io::Result<()>;
}

impl<K: Kernel + ?Sized> Kernel for &K {
    fn pool_fd(&self) -> BorrowedFd<'_> {
        (**self).pool_fd()
    }
    fn hello(&self, cmd: &mut HelloCmd) -> io::Result<()> {
        (**self).hello(cmd)
    }
    fn send(&self, kmsg: &KmsgBuf) -> io::Result<()> {
        (**self).send(kmsg)
    }
    fn recv(&self) -> io::Result<u64> {
        (**self).recv()
    }
    fn free(&self, offset: u64) -> io::Result<()> {
        (**self).free(offset)
    }
    fn memfd_new(&self) -> io::Result<OwnedFd> {
        (**self).memfd_new()
    }
    fn memfd_set_size(&self, memfd: BorrowedFd<'_>, size: u64) -> io::Result<()> {
        (**self).memfd_set_size(memfd, size)
    }
    fn memfd_seal(&self, memfd: BorrowedFd<'_>, sealed: bool) -> io::Result<()> {
        (**self).memfd_seal(memfd, sealed)
    }
    fn monitor(&self, enable: bool) -> io::Result<()> {
        (**self).monitor(enable)
    }
}

/// Bus administration: the control node plus opening bus nodes.
pub trait ControlDevice {
    type Endpoint: Kernel;

    /// Numeric identity bus names are prefixed with.
    fn uid(&self) -> u32;

    /// Opens a control handle, creates a bus and returns the handle that
    /// keeps it alive. The kernel may update the command's flags.
    fn bus_make(&self, cmd: &mut MakeCmd) -> io::Result<OwnedFd>;

    /// As [`ControlDevice::bus_make`], for a namespace.
    fn ns_make(&self, cmd: &mut MakeCmd) -> io::Result<OwnedFd>;

    /// Opens an existing bus node.
    fn open(&self, path: &Path) -> io::Result<Self::Endpoint>;
}

/// True when the error means "no data yet" or "interrupted, try again".
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EINTR))
}
