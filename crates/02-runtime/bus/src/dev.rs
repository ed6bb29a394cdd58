//! `/dev/kdbus` backend of [`Kernel`] and [`ControlDevice`].

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use kdbus_wire::abi::{KMSG_HEADER_SIZE, MONITOR_ENABLE};
use kdbus_wire::{
    HelloCmd, KmsgBuf, MakeCmd, BUS_MAKE_FIXED_SIZE, HELLO_FIXED_SIZE, NS_MAKE_FIXED_SIZE,
};

use crate::admin::CONTROL_PATH;
use crate::kernel::{ControlDevice, Kernel};

const IOC_MAGIC: u64 = 0x95;
const IOC_NONE: u64 = 0;
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | (IOC_MAGIC << 8) | nr
}

const PTR_SIZE: usize = std::mem::size_of::<u64>();

const CMD_BUS_MAKE: u64 = ioc(IOC_WRITE, 0x00, BUS_MAKE_FIXED_SIZE);
const CMD_NS_MAKE: u64 = ioc(IOC_READ, 0x10, NS_MAKE_FIXED_SIZE);
const CMD_HELLO: u64 = ioc(IOC_READ | IOC_WRITE, 0x30, HELLO_FIXED_SIZE);
const CMD_MSG_SEND: u64 = ioc(IOC_WRITE, 0x40, KMSG_HEADER_SIZE);
const CMD_MSG_RECV: u64 = ioc(IOC_READ, 0x41, PTR_SIZE);
const CMD_FREE: u64 = ioc(IOC_WRITE, 0x42, PTR_SIZE);
const CMD_MONITOR: u64 = ioc(IOC_WRITE, 0x80, 16);
const CMD_MEMFD_NEW: u64 = ioc(IOC_READ, 0x90, PTR_SIZE);
const CMD_MEMFD_SIZE_SET: u64 = ioc(IOC_WRITE, 0x92, PTR_SIZE);
const CMD_MEMFD_SEAL_SET: u64 = ioc(IOC_NONE, 0x94, 0);

/// Issues one ioctl, mapping a negative return to the thread's errno.
///
/// # Safety
///
/// `arg` must be what `request` expects: a pointer to a live, correctly
/// sized and aligned argument, or a plain integer for by-value requests.
unsafe fn ioctl(fd: RawFd, request: u64, arg: usize) -> io::Result<()> {
    if libc::ioctl(fd, request as _, arg) < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// An open bus node (`/dev/kdbus/<uid>-<name>/bus`).
#[derive(Debug)]
pub struct KdbusEndpoint {
    fd: OwnedFd,
}

impl KdbusEndpoint {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
            .open(path)?;
        Ok(Self { fd: file.into() })
    }

    /// Wraps an already opened bus descriptor.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl Kernel for KdbusEndpoint {
    fn pool_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    fn hello(&self, cmd: &mut HelloCmd) -> io::Result<()> {
        // SAFETY: the hello buffer is 8-aligned and sized by its own header.
        unsafe { ioctl(self.fd.as_raw_fd(), CMD_HELLO, cmd.as_mut_ptr() as usize) }
    }

    fn send(&self, kmsg: &KmsgBuf) -> io::Result<()> {
        // SAFETY: the kernel only reads the message; its size field matches
        // the buffer.
        unsafe { ioctl(self.fd.as_raw_fd(), CMD_MSG_SEND, kmsg.as_ptr() as usize) }
    }

    fn recv(&self) -> io::Result<u64> {
        let mut offset: u64 = 0;
        // SAFETY: the kernel writes one u64.
        unsafe {
            ioctl(
                self.fd.as_raw_fd(),
                CMD_MSG_RECV,
                &mut offset as *mut u64 as usize,
            )?
        };
        Ok(offset)
    }

    fn free(&self, offset: u64) -> io::Result<()> {
        // SAFETY: the kernel reads one u64.
        unsafe { ioctl(self.fd.as_raw_fd(), CMD_FREE, &offset as *const u64 as usize) }
    }

    fn memfd_new(&self) -> io::Result<OwnedFd> {
        let mut fd: libc::c_int = -1;
        // SAFETY: the kernel writes one int.
        unsafe {
            ioctl(
                self.fd.as_raw_fd(),
                CMD_MEMFD_NEW,
                &mut fd as *mut libc::c_int as usize,
            )?
        };
        // SAFETY: on success the kernel installed a fresh descriptor for us.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn memfd_set_size(&self, memfd: BorrowedFd<'_>, size: u64) -> io::Result<()> {
        // SAFETY: the kernel reads one u64.
        unsafe { ioctl(memfd.as_raw_fd(), CMD_MEMFD_SIZE_SET, &size as *const u64 as usize) }
    }

    fn memfd_seal(&self, memfd: BorrowedFd<'_>, sealed: bool) -> io::Result<()> {
        // SAFETY: by-value integer argument.
        unsafe { ioctl(memfd.as_raw_fd(), CMD_MEMFD_SEAL_SET, sealed as usize) }
    }

    fn monitor(&self, enable: bool) -> io::Result<()> {
        let cmd: [u64; 2] = [0, if enable { MONITOR_ENABLE } else { 0 }];
        // SAFETY: `{ id, flags }`, read by the kernel.
        unsafe { ioctl(self.fd.as_raw_fd(), CMD_MONITOR, cmd.as_ptr() as usize) }
    }
}

/// The real control node, acting as the calling user.
#[derive(Clone, Copy, Debug, Default)]
pub struct DevKdbus;

impl DevKdbus {
    fn make(&self, request: u64, cmd: &mut MakeCmd) -> io::Result<OwnedFd> {
        let control = KdbusEndpoint::open(Path::new(CONTROL_PATH))?;
        // SAFETY: the make buffer is 8-aligned and sized by its own header.
        unsafe { ioctl(control.fd.as_raw_fd(), request, cmd.as_mut_ptr() as usize)? };
        Ok(control.fd)
    }
}

impl ControlDevice for DevKdbus {
    type Endpoint = KdbusEndpoint;

    fn uid(&self) -> u32 {
        // SAFETY: getuid cannot fail.
        unsafe { libc::getuid() }
    }

    fn bus_make(&self, cmd: &mut MakeCmd) -> io::Result<OwnedFd> {
        self.make(CMD_BUS_MAKE, cmd)
    }

    fn ns_make(&self, cmd: &mut MakeCmd) -> io::Result<OwnedFd> {
        self.make(CMD_NS_MAKE, cmd)
    }

    fn open(&self, path: &Path) -> io::Result<KdbusEndpoint> {
        KdbusEndpoint::open(path)
    }
}
